/// Concurrent access tests: one database handle shared across threads
use lode_api::{Database, Query, SortedMerge};
use lode_test_utils::*;
use std::sync::Arc;
use std::thread;

const WRITERS: usize = 4;
const PER_WRITER: usize = 50;

fn shared(backend: Backend) -> (TestDatabase, Arc<Database>) {
    let t = TestDatabase::new(backend, &fixture_schema());
    let db = Arc::new(
        t.connect_again(&fixture_schema(), Default::default())
            .expect("Failed to open shared handle"),
    );
    (t, db)
}

#[test]
fn test_concurrent_writers() {
    for backend in Backend::ALL {
        let (_t, db) = shared(backend);

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        let id = (w * PER_WRITER + i) as i32 + 100;
                        db.put("animals", animal(id, "goat", "white", 1, 4)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(db.count(&Query::store("animals")).unwrap(), WRITERS * PER_WRITER);
        let legs = Query::index("animals", "legs").only(4).unwrap();
        assert_eq!(db.count(&legs).unwrap(), WRITERS * PER_WRITER);
    }
}

#[test]
fn test_readers_see_whole_batches() {
    for backend in Backend::ALL {
        let (_t, db) = shared(backend);

        let writer = {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut generator = MockDataGenerator::new();
                for _ in 0..20 {
                    db.put_all("animals", generator.animals(10)).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let n = db.count(&Query::store("animals")).unwrap();
                        assert_eq!(n % 10, 0, "saw a partial batch: {}", n);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(db.count(&Query::store("animals")).unwrap(), 200);
    }
}

#[test]
fn test_concurrent_scans() {
    for backend in Backend::ALL {
        let (_t, db) = shared(backend);
        load_animals(&db);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    let queries = [
                        Query::index("animals", "horn").only(2).unwrap(),
                        Query::index("animals", "color").only("spots").unwrap(),
                    ];
                    let mut solver = SortedMerge::new(Vec::new());
                    db.scan(&mut solver, &queries).unwrap();
                    solver.into_output()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), int_keys(&[2, 7]));
        }
    }
}
