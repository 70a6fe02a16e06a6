//! Catalog node store
//!
//! Persists versioned nodes, view-definition snapshots and catalog runs.
//! Historical rows are never deleted, only closed: a changed node gets a new
//! current row and the old one keeps its history.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL-backed store
//!
//! [`MemoryNodeStore`] is always available and persists to a JSON snapshot.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::{MemoryNodeStore, StoreSnapshot};
pub use postgres::PostgresNodeStore;
pub use store::NodeStore;
