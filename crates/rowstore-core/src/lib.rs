//! RowStore Core: embedded file-backed row store
//!
//! Rows are schemaless field maps persisted in numbered row files, each file
//! holding a fixed range of consecutive row ids. The engine is built from a
//! handful of services shared by one table:
//!
//! - **Ledger**: row id to (file, position, size), with a short version log
//! - **Buffer**: write-behind staging of mutations, doubling as a row cache
//! - **Collect**: crash-safe file compaction through a temp file and rename
//! - **Keepers**: per-field ordered indexes (binary tree or sorted map)
//! - **Destroyers**: persistence of in-memory state on idle or shutdown
//!
//! Every file access goes through a process-wide keyed read/write lock.

pub mod buffer;
pub mod codec;
pub mod condition;
pub mod config;
pub mod destroy;
pub mod error;
pub mod files;
pub mod index;
pub mod keeper;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod platform_durability;
pub mod repository;
pub mod stream;
pub mod value;

// Re-export key types for convenience
pub use buffer::{Buffer, State};
pub use codec::ObjectConverter;
pub use condition::{ComplexKind, Condition, ConditionEvaluator, SimpleCondition, SimpleKind, StandardEvaluator};
pub use config::{Config, KeeperKind};
pub use destroy::{DestroyService, Destroyable, Registration};
pub use error::{StoreError, StoreResult};
pub use files::{CollectEntry, FileHelper};
pub use index::{IndexService, SearchResult};
pub use ledger::{RowAddress, RowLedger};
pub use lock::{file_locks, KeyedLock, KeyedRwLock, LockMode};
pub use model::{FieldInfo, ModelService};
pub use repository::RowRepository;
pub use value::{FieldType, Row, RowId, Value};
