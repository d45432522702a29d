//! Satchel storage layer.
//!
//! Durable, versioned storage of record collections plus the outbox of
//! pending mutations, behind a backend-agnostic trait:
//! - `KeyValueStore` trait with the atomic mutation+outbox contract
//! - In-memory backend for tests and development
//! - SQLite backend for durable deployments

pub mod memory;
pub mod outbox;
pub mod sqlite;
pub mod store;

// Re-export main types
pub use memory::MemoryStore;
pub use outbox::{EntryId, OperationKind, OutboxEntry};
pub use sqlite::SqliteStore;
pub use store::KeyValueStore;
