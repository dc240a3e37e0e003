//! RowStore table interface
//!
//! The narrow surface external collaborators call: table lifecycle, row CRUD,
//! field and index management and condition search.
//!
//! # Architecture
//!
//! A `TableManager` owns a root directory holding one subdirectory per table
//! plus the persisted table list. Each `Table` wires its own model, ledger,
//! field indexes and row repository from `rowstore-core`, and registers them
//! with the manager's destroy service, so in-memory state reaches disk when
//! the store goes idle and when the manager is closed.

pub mod error;
pub mod manager;
pub mod table;

pub use error::{TableError, TableResult};
pub use manager::TableManager;
pub use table::Table;
