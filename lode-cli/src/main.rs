use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lode_api::{ConnectorConfig, Database, Flow, LodeKey, LodeValue, Query};
use lode_core::{DatabaseSchema, Entry, KeyRange};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
    /// JSON Lines (one record per line)
    Jsonl,
}

#[derive(Parser)]
#[command(name = "lode")]
#[command(about = "Lode database CLI", long_about = None)]
struct Cli {
    /// Directory holding the database files
    dir: PathBuf,
    /// Database name
    name: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stores and indexes found on disk
    Schema {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Count records in a store or entries in an index
    Count {
        store: String,
        #[arg(short, long)]
        index: Option<String>,
        /// Count distinct index keys
        #[arg(long)]
        unique: bool,
    },
    /// List records in key order
    List {
        store: String,
        /// Walk this index instead of the primary key
        #[arg(short, long)]
        index: Option<String>,
        /// Inclusive lower bound as JSON
        #[arg(long)]
        lower: Option<String>,
        /// Inclusive upper bound as JSON
        #[arg(long)]
        upper: Option<String>,
        #[arg(short, long)]
        reverse: bool,
        #[arg(long)]
        unique: bool,
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,
        /// Records to skip first
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Get a record by primary key
    Get {
        store: String,
        /// Primary key as JSON, e.g. 42 or '"abc"' or '[1, "x"]'
        key: String,
    },
    /// Put a record
    Put {
        store: String,
        /// Record as JSON
        record: String,
        /// Out-of-line primary key as JSON
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Delete a record by primary key
    Delete {
        store: String,
        /// Primary key as JSON
        key: String,
    },
    /// Delete the whole database
    Drop,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = open(&cli.dir, &cli.name)?;

    match cli.command {
        Commands::Schema { output } => {
            let schema = db.schema().context("Failed to read schema")?;
            match output {
                OutputFormat::Table => {
                    println!("version {}", schema.version.unwrap_or(0));
                    println!("{}", table::format_schema_table(&schema));
                }
                OutputFormat::Json | OutputFormat::Jsonl => {
                    println!("{}", serde_json::to_string_pretty(&schema)?);
                }
            }
        }

        Commands::Count { store, index, unique } => {
            let mut query = query_for(&store, index);
            if unique {
                query = query.unique();
            }
            let n = db.count(&query).context("Failed to count")?;
            println!("{}", n);
        }

        Commands::List {
            store,
            index,
            lower,
            upper,
            reverse,
            unique,
            limit,
            offset,
            output,
        } => {
            let mut query = query_for(&store, index);
            if let Some(range) = parse_range(lower.as_deref(), upper.as_deref())? {
                query = query.with_range(range);
            }
            if reverse {
                query = query.reverse();
            }
            if unique {
                query = query.unique();
            }

            let mut entries = Vec::new();
            let mut skipped = 0;
            db.open(&query, |entry| {
                if skipped < offset {
                    skipped += 1;
                    return Flow::Next;
                }
                entries.push(entry.clone());
                if limit.map_or(false, |limit| entries.len() >= limit) {
                    Flow::Stop
                } else {
                    Flow::Next
                }
            })
            .context("Failed to list records")?;
            print_entries(&entries, output)?;
        }

        Commands::Get { store, key } => {
            let key = parse_key(&key)?;
            match db.get(&store, key).context("Failed to get record")? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value.to_json())?),
                None => println!("Record not found"),
            }
        }

        Commands::Put { store, record, key } => {
            let json: serde_json::Value = serde_json::from_str(&record).context("Invalid JSON")?;
            let value = LodeValue::from_json(json);
            let stored = match key {
                Some(key) => db.put_with_key(&store, value, parse_key(&key)?),
                None => db.put(&store, value),
            }
            .context("Failed to put record")?;
            println!("Record stored under {}", stored);
        }

        Commands::Delete { store, key } => {
            let key = parse_key(&key)?;
            let removed = db.delete(&store, key).context("Failed to delete record")?;
            println!("{} record(s) deleted", removed);
        }

        Commands::Drop => {
            let path = cli.dir.join(format!("{}.db", cli.name));
            if db.delete_database().context("Failed to delete database")? {
                println!("Database deleted: {}", path.display());
            } else {
                println!("Nothing to delete");
            }
        }
    }

    Ok(())
}

/// Opens in editable-schema mode: existing stores are adopted as they are.
fn open(dir: &Path, name: &str) -> Result<Database> {
    tracing::info!("Opening database '{}' in {}", name, dir.display());
    Database::open_sqlite_with_config(dir, name, &DatabaseSchema::new(), ConnectorConfig::new().editable())
        .with_context(|| format!("Failed to open database '{}' in {}", name, dir.display()))
}

fn query_for(store: &str, index: Option<String>) -> Query {
    match index {
        Some(index) => Query::index(store, index),
        None => Query::store(store),
    }
}

fn parse_key(text: &str) -> Result<LodeKey> {
    let json: serde_json::Value =
        serde_json::from_str(text).with_context(|| format!("Invalid key JSON: {}", text))?;
    LodeValue::from_json(json)
        .to_key()
        .ok_or_else(|| anyhow!("Not a valid key: {}", text))
}

fn parse_range(lower: Option<&str>, upper: Option<&str>) -> Result<Option<KeyRange>> {
    let range = match (lower.map(parse_key).transpose()?, upper.map(parse_key).transpose()?) {
        (None, None) => return Ok(None),
        (Some(lower), None) => KeyRange::lower_bound(lower, false)?,
        (None, Some(upper)) => KeyRange::upper_bound(upper, false)?,
        (Some(lower), Some(upper)) => KeyRange::bound(lower, upper, false, false)?,
    };
    Ok(Some(range))
}

fn entry_json(entry: &Entry) -> serde_json::Value {
    serde_json::json!({
        "key": LodeValue::from(entry.key.clone()).to_json(),
        "primaryKey": LodeValue::from(entry.primary_key.clone()).to_json(),
        "value": entry.value.as_ref().map(LodeValue::to_json),
    })
}

fn print_entries(entries: &[Entry], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Table => println!("{}", table::format_entries_table(entries)),
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = entries.iter().map(entry_json).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Jsonl => {
            for entry in entries {
                println!("{}", serde_json::to_string(&entry_json(entry))?);
            }
        }
    }
    Ok(())
}
