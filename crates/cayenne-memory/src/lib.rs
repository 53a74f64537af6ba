//! In-memory data node for the Cayenne object graph engine.
//!
//! [`MemoryNode`] stores rows in plain tables and checks the constraints a
//! relational database would: NOT NULL columns, primary key uniqueness and
//! foreign keys, all enforced per statement. It is the reference node for
//! tests and for running the engine without a database.
//!
//! - Auto-increment keys for generated primary key columns.
//! - Joint selects (left joins), projections and join table qualifiers.
//! - Transactions applied atomically on commit.
//! - Query and operation counters, plus failure injection.

pub mod node;
pub mod table;

pub use node::{MemoryNode, MemoryTransaction, NodeStats};
pub use table::{ForeignKey, TableDef};
