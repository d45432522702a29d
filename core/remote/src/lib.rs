//! Satchel remote API layer.
//!
//! The authoritative CRUD service behind a client-agnostic trait:
//! - `RemoteApi` trait with the transient/permanent error classification
//! - HTTP client with bearer auth and the canonical response envelope
//! - In-memory fake for tests and development

pub mod api;
pub mod http;
pub mod memory;

// Re-export main types
pub use api::{record_from_value, records_from_value, unwrap_envelope, RemoteApi, RemoteRecord};
pub use http::{HttpRemote, StaticToken, TokenSource};
pub use memory::MemoryRemote;
