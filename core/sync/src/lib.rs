//! Satchel sync engine.
//!
//! This module reconciles the local store with the remote API:
//! - Outbox draining with per-record ordering and id reconciliation
//! - Snapshot pulls that never clobber pending local edits
//! - Retry strategy with exponential backoff for transient errors
//! - Connectivity monitoring and reconnect-triggered syncs
//! - Background scheduling with a single-flight guarantee

pub mod connectivity;
pub mod engine;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use connectivity::ConnectivityMonitor;
pub use engine::{SyncEngine, SyncEvent, SyncFailure, SyncReport};
pub use retry::{retry, RetryExecutor, RetryPolicy};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerWorker};
