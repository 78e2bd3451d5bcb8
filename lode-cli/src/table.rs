/// Table formatting for CLI output using comfy-table

use base64::{engine::general_purpose::STANDARD, Engine as _};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use lode_api::LodeValue;
use lode_core::{DatabaseSchema, Entry};
use std::collections::BTreeSet;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Format cursor entries as a table
///
/// The first two columns are the effective key and the primary key. Map
/// records contribute one column per field across all entries; any other
/// record is shown in a single `value` column.
pub fn format_entries_table(entries: &[Entry]) -> String {
    if entries.is_empty() {
        return "No records found".to_string();
    }

    let mut columns = BTreeSet::new();
    let mut scalar = false;
    for entry in entries {
        match &entry.value {
            Some(LodeValue::Map(fields)) => columns.extend(fields.keys().cloned()),
            Some(_) => scalar = true,
            None => {}
        }
    }
    let columns: Vec<String> = columns.into_iter().collect();

    let mut header = vec![Cell::new("key"), Cell::new("primary key")];
    header.extend(columns.iter().map(Cell::new));
    if scalar {
        header.push(Cell::new("value"));
    }

    let mut table = new_table();
    table.set_header(header);
    for entry in entries {
        let mut row = vec![
            Cell::new(entry.key.to_string()),
            Cell::new(entry.primary_key.to_string()),
        ];
        let fields = match &entry.value {
            Some(LodeValue::Map(fields)) => Some(fields),
            _ => None,
        };
        for column in &columns {
            let cell = fields
                .and_then(|f| f.get(column))
                .map(format_value)
                .unwrap_or_else(|| "-".to_string());
            row.push(Cell::new(cell));
        }
        if scalar {
            let cell = match &entry.value {
                Some(LodeValue::Map(_)) | None => "-".to_string(),
                Some(other) => format_value(other),
            };
            row.push(Cell::new(cell));
        }
        table.add_row(row);
    }

    table.to_string()
}

/// Format a schema as one row per store and index
pub fn format_schema_table(schema: &DatabaseSchema) -> String {
    if schema.stores.is_empty() {
        return "No stores".to_string();
    }

    let mut table = new_table();
    table.set_header(vec!["store", "index", "key path", "flags"]);
    for store in &schema.stores {
        let key_path = store
            .key_path
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "(out-of-line)".to_string());
        let flags = if store.auto_increment { "autoIncrement" } else { "" };
        table.add_row(vec![store.name.as_str(), "", key_path.as_str(), flags]);

        for index in &store.indexes {
            let mut flags = Vec::new();
            if index.unique {
                flags.push("unique");
            }
            if index.multi_entry {
                flags.push("multiEntry");
            }
            table.add_row(vec![
                String::new(),
                index.name.clone(),
                index.key_path.to_string(),
                flags.join(", "),
            ]);
        }
    }
    table.to_string()
}

/// Format a value for display in a table cell
pub fn format_value(value: &LodeValue) -> String {
    match value {
        LodeValue::Null => "null".to_string(),
        LodeValue::Bool(b) => b.to_string(),
        LodeValue::Number(n) => n.to_string(),
        LodeValue::String(s) => s.clone(),
        LodeValue::Date(d) => format!("Date({})", d),
        LodeValue::Binary(bytes) => STANDARD.encode(bytes),
        LodeValue::List(items) => {
            let items: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", items.join(", "))
        }
        LodeValue::Map(map) => {
            let pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("\"{}\": {}", k, format_value(v)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_api::{IndexSchema, LodeKey, RecordBuilder, StoreSchema};

    fn entry(id: i32, value: LodeValue) -> Entry {
        Entry {
            key: LodeKey::from(id),
            primary_key: LodeKey::from(id),
            value: Some(value),
        }
    }

    #[test]
    fn test_format_empty_entries() {
        assert_eq!(format_entries_table(&[]), "No records found");
    }

    #[test]
    fn test_format_mixed_fields() {
        let entries = vec![
            entry(1, RecordBuilder::new().string("name", "Alice").number("age", 30).build()),
            entry(2, RecordBuilder::new().string("name", "Bob").bool("active", true).build()),
        ];
        let output = format_entries_table(&entries);
        assert!(output.contains("Alice"));
        assert!(output.contains("Bob"));
        assert!(output.contains("true"));
        assert!(output.contains("age"));
        assert!(output.contains("-"));
        assert!(!output.contains("value"));
    }

    #[test]
    fn test_format_scalar_records() {
        let entries = vec![entry(1, LodeValue::from("note"))];
        let output = format_entries_table(&entries);
        assert!(output.contains("value"));
        assert!(output.contains("note"));
    }

    #[test]
    fn test_format_value_types() {
        assert_eq!(format_value(&LodeValue::from("test")), "test");
        assert_eq!(format_value(&LodeValue::Number(42.0)), "42");
        assert_eq!(format_value(&LodeValue::Bool(true)), "true");
        assert_eq!(format_value(&LodeValue::Null), "null");
        assert_eq!(format_value(&LodeValue::binary(vec![1u8, 2, 3])), "AQID");
        let list = LodeValue::List(vec![LodeValue::from("a"), LodeValue::Number(1.0)]);
        assert_eq!(format_value(&list), "[a, 1]");
    }

    #[test]
    fn test_format_schema() {
        let schema = DatabaseSchema::new().with_store(
            StoreSchema::new("st")
                .with_key_path("id")
                .with_index(IndexSchema::new("tags", "tags").multi_entry().unique()),
        );
        let output = format_schema_table(&schema);
        assert!(output.contains("st"));
        assert!(output.contains("tags"));
        assert!(output.contains("unique, multiEntry"));
    }
}
