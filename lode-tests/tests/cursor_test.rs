/// Cursor ordering, counting and resumption against both engines
use lode_api::{ConnectorConfig, Flow, LodeKey, LodeValue, Query, StoreSchema};
use lode_core::{Completion, DatabaseSchema, IndexSchema, KeyRange};
use lode_test_utils::*;
use proptest::prelude::*;

fn numbers_schema() -> DatabaseSchema {
    DatabaseSchema::new().with_store(
        StoreSchema::new("nums")
            .with_key_path("id")
            .with_index(IndexSchema::new("value", "value")),
    )
}

fn tagged(backend: Backend) -> TestDatabase {
    let t = TestDatabase::new(backend, &fixture_schema());
    load_tagged(&t.db);
    t
}

fn entries(t: &TestDatabase, query: &Query) -> Vec<(LodeKey, LodeKey)> {
    let mut out = Vec::new();
    t.db.open(query, |entry| {
        out.push((entry.key.clone(), entry.primary_key.clone()));
        Flow::Next
    })
    .unwrap();
    out
}

#[test]
fn test_multi_entry_unique_keys() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        let query = Query::index("st", "tags").unique();
        assert_eq!(
            t.db.keys(&query, None).unwrap(),
            vec![
                LodeKey::from("a"),
                LodeKey::from("b"),
                LodeKey::from("c"),
                LodeKey::from("x"),
            ]
        );
        assert_eq!(t.db.primary_keys(&query, None).unwrap(), int_keys(&[0, 0, 4, 1]));
        assert_eq!(t.db.count(&query).unwrap(), 4);

        let reverse = t.db.primary_keys(&query.clone().reverse(), None).unwrap();
        assert_eq!(reverse, int_keys(&[2, 6, 7, 5]), "{:?}", backend);
    }
}

#[test]
fn test_multi_entry_record_listed_once_per_tag() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        // ["c", "c"] contributes a single entry
        let c = Query::index("st", "tags").only("c").unwrap();
        assert_eq!(t.db.primary_keys(&c, None).unwrap(), int_keys(&[4, 6]));

        let a = Query::index("st", "tags").only("a").unwrap();
        let values = t.db.values(&a, None).unwrap();
        let ids: Vec<f64> = values
            .iter()
            .filter_map(|v| v.get("id").and_then(LodeValue::as_number))
            .collect();
        assert_eq!(ids, vec![0.0, 2.0, 5.0]);
    }
}

#[test]
fn test_multi_entry_follows_updates() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        let record = LodeValue::from_json(serde_json::json!({ "id": 3, "value": 3, "tags": ["z", "a"] }));
        t.db.put("st", record).unwrap();
        t.db.delete("st", 0).unwrap();

        let a = Query::index("st", "tags").only("a").unwrap();
        assert_eq!(t.db.primary_keys(&a, None).unwrap(), int_keys(&[2, 3, 5]));
        let z = Query::index("st", "tags").only("z").unwrap();
        assert_eq!(t.db.count(&z).unwrap(), 1);
        assert_eq!(t.db.count(&Query::index("st", "tags")).unwrap(), 10);
    }
}

#[test]
fn test_resume_after_position() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        let query = Query::index("st", "value");
        let all = entries(&t, &query);
        let (key, pk) = all[3].clone();

        let resumed = entries(&t, &query.clone().resume_after(key.clone(), Some(pk)));
        assert_eq!(resumed, all[4..].to_vec(), "{:?}", backend);

        // Without a primary key the whole key is skipped
        let skipped = entries(&t, &query.clone().resume_after(key.clone(), None));
        assert!(skipped.iter().all(|(k, _)| *k > key));
    }
}

#[test]
fn test_continue_in_callback() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        let mut seen = Vec::new();
        let completion = t
            .db
            .open(&Query::index("st", "value"), |entry| {
                seen.push(entry.primary_key.clone());
                if entry.key == LodeKey::from(1) {
                    Flow::Continue(LodeKey::from(3))
                } else {
                    Flow::Next
                }
            })
            .unwrap();
        assert_eq!(completion, Completion::Exhausted);
        assert_eq!(seen, int_keys(&[2, 0, 3, 4, 6]));
    }
}

#[test]
fn test_first_on_empty_range() {
    for backend in Backend::ALL {
        let t = tagged(backend);
        let query = Query::store("st").with_range(KeyRange::bound(100, 200, false, false).unwrap());
        assert!(t.db.first(&query).unwrap().is_none());
        assert_eq!(t.db.count(&query).unwrap(), 0);
    }
}

fn expected_entries(
    values: &[i32],
    lower: i32,
    upper: i32,
    reverse: bool,
    unique: bool,
) -> Vec<(LodeKey, LodeKey)> {
    let mut rows: Vec<(i32, i32)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| (lower..=upper).contains(*v))
        .map(|(id, v)| (*v, id as i32))
        .collect();
    rows.sort();
    if reverse {
        rows.reverse();
    }
    if unique {
        rows.dedup_by_key(|(v, _)| *v);
    }
    rows.into_iter()
        .map(|(v, id)| (LodeKey::from(v), LodeKey::from(id)))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_index_order_and_count(
        values in prop::collection::vec(0i32..10, 0..40),
        lower in 0i32..10,
        span in 0i32..10,
        reverse in any::<bool>(),
        unique in any::<bool>(),
        prefetch in 1usize..6,
    ) {
        let upper = lower + span;
        let expected = expected_entries(&values, lower, upper, reverse, unique);

        for backend in Backend::ALL {
            let config = ConnectorConfig::new().with_cursor_prefetch(prefetch);
            let t = TestDatabase::with_config(backend, &numbers_schema(), config);
            let records = values
                .iter()
                .enumerate()
                .map(|(id, v)| LodeValue::from_json(serde_json::json!({ "id": id, "value": v })))
                .collect();
            t.db.put_all("nums", records).unwrap();

            let mut query = Query::index("nums", "value")
                .with_range(KeyRange::bound(lower, upper, false, false).unwrap());
            if reverse {
                query = query.reverse();
            }
            if unique {
                query = query.unique();
            }

            prop_assert_eq!(entries(&t, &query), expected.clone());
            prop_assert_eq!(t.db.count(&query).unwrap(), expected.len());
        }
    }
}
