pub mod error;
pub mod key;
pub mod range;
pub mod value;
pub mod schema;
pub mod config;
pub mod connector; // engine-specific storage (sqlite, memory)
pub mod query;
pub mod cursor;
pub mod algo; // join solvers and the scan driver

pub use error::{Error, Result};
pub use key::Key;
pub use range::{Comparison, KeyRange};
pub use value::Value;
pub use schema::{DatabaseSchema, IndexSchema, KeyPath, StoreSchema};
pub use config::{ConflictPolicy, ConnectorConfig};
pub use connector::{
    Connected, EngineKind, Entry, MemoryConnector, MemoryEngine, SqliteConnector,
    StorageConnector, Transaction, TransactionMode,
};
pub use query::Query;
pub use cursor::{Completion, Cursor, CursorStats, Flow, Position};
pub use algo::{NestedLoop, ScanStats, Sink, Solver, SortedMerge, ZigzagMerge};
