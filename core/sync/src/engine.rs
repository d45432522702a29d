//! Core sync engine: reconciles local and remote state.
//!
//! The engine is the only component that talks to both the store and the
//! remote API for reconciliation. It is constructed from injected
//! collaborators, so multiple instances can run side by side in tests
//! without shared state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use satchel_common::{CollectionName, Collections, Error, Record, RecordId, Result};
use satchel_remote::RemoteApi;
use satchel_storage::{EntryId, KeyValueStore, OperationKind, OutboxEntry};

use crate::connectivity::ConnectivityMonitor;
use crate::retry::{RetryExecutor, RetryPolicy};

/// One pending mutation the engine gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    /// Outbox entry id (already removed from the queue).
    pub entry: EntryId,
    /// Collection of the target record.
    pub collection: CollectionName,
    /// Target record at the time of the failure.
    pub target: RecordId,
    /// Operation that could not be delivered.
    pub kind: OperationKind,
    /// Why it was abandoned.
    pub reason: String,
}

/// Aggregated outcome of a sync cycle. Partial failures are reported here,
/// never raised as errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Entries confirmed by the remote and removed from the outbox.
    pub pushed: usize,
    /// Entries left queued after transient failures (or while offline).
    pub retained: usize,
    /// Entries removed because no retry can ever deliver them.
    pub abandoned: Vec<SyncFailure>,
    /// Records materialized from pulled snapshots.
    pub pulled: usize,
    /// Collections whose pull failed, with the reason.
    pub pull_failures: Vec<(CollectionName, String)>,
    /// The cycle was skipped because the monitor reported offline.
    pub offline: bool,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

impl SyncReport {
    /// Whether the cycle finished with nothing left behind.
    pub fn is_clean(&self) -> bool {
        !self.offline
            && self.retained == 0
            && self.abandoned.is_empty()
            && self.pull_failures.is_empty()
    }
}

/// Notifications for the application layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pending mutation was abandoned; the application should surface it.
    EntryRejected(SyncFailure),
    /// A sync cycle finished.
    CycleCompleted {
        pushed: usize,
        pulled: usize,
        retained: usize,
        abandoned: usize,
    },
}

/// Sync engine coordinating push and pull for all configured collections.
pub struct SyncEngine {
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    collections: Collections,
    retry: RetryExecutor,
    /// Single-flight gate: at most one sync cycle runs at a time.
    gate: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    /// Create a new engine from injected collaborators.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
        collections: Collections,
        policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            remote,
            monitor,
            collections,
            retry: RetryExecutor::new(policy),
            gate: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The configured collection set.
    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Drain the outbox against the remote API.
    ///
    /// Returns a report whose pull fields are zero.
    pub async fn push_pending(&self) -> Result<SyncReport> {
        let _guard = self.gate.lock().await;
        let start = Instant::now();
        if !self.monitor.is_online() {
            let retained = self.store.pending_entries().await?.len();
            return Ok(SyncReport {
                retained,
                offline: true,
                duration: start.elapsed(),
                ..SyncReport::default()
            });
        }
        let (pushed, retained, abandoned) = self.push_unlocked().await?;
        Ok(SyncReport {
            pushed,
            retained,
            abandoned,
            duration: start.elapsed(),
            ..SyncReport::default()
        })
    }

    /// Refresh the local snapshot of one collection from the remote,
    /// leaving records with pending entries untouched.
    pub async fn pull_remote(&self, collection: &CollectionName) -> Result<usize> {
        let _guard = self.gate.lock().await;
        if !self.monitor.is_online() {
            return Err(Error::Network("Reported offline".to_string()));
        }
        self.pull_unlocked(collection).await
    }

    /// Push everything pending, then pull every configured collection.
    ///
    /// Per-entry and per-collection failures land in the report; only a
    /// local storage failure is an error.
    pub async fn force_sync(&self) -> Result<SyncReport> {
        let _guard = self.gate.lock().await;
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let start = Instant::now();

        if !self.monitor.is_online() {
            let retained = self.store.pending_entries().await?.len();
            debug!(retained, "Offline; sync cycle skipped");
            return Ok(SyncReport {
                retained,
                offline: true,
                duration: start.elapsed(),
                ..SyncReport::default()
            });
        }

        info!("Starting sync cycle");
        let (pushed, retained, abandoned) = self.push_unlocked().await?;

        let pulls = join_all(self.collections.names().into_iter().map(|name| async move {
            let result = self.pull_unlocked(&name).await;
            (name, result)
        }))
        .await;

        let mut pulled = 0;
        let mut pull_failures = Vec::new();
        for (name, result) in pulls {
            match result {
                Ok(count) => pulled += count,
                Err(e) if matches!(e, Error::Storage(_) | Error::Serialization(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(collection = %name, "Pull failed: {}", e);
                    pull_failures.push((name, e.to_string()));
                }
            }
        }

        let report = SyncReport {
            pushed,
            retained,
            abandoned,
            pulled,
            pull_failures,
            offline: false,
            duration: start.elapsed(),
        };
        info!(
            "Sync cycle completed in {:?}: {} pushed, {} pulled, {} retained, {} abandoned",
            report.duration,
            report.pushed,
            report.pulled,
            report.retained,
            report.abandoned.len()
        );
        let _ = self.events.send(SyncEvent::CycleCompleted {
            pushed: report.pushed,
            pulled: report.pulled,
            retained: report.retained,
            abandoned: report.abandoned.len(),
        });
        Ok(report)
    }

    /// Replay pending entries in order.
    ///
    /// Entries for one record replay strictly in creation order: the first
    /// failure for a record blocks its later entries for this cycle, while
    /// entries for other records keep going.
    async fn push_unlocked(&self) -> Result<(usize, usize, Vec<SyncFailure>)> {
        let entries = self.store.pending_entries().await?;
        if entries.is_empty() {
            return Ok((0, 0, Vec::new()));
        }
        debug!(count = entries.len(), "Pushing pending entries");

        let mut pushed = 0;
        let mut retained = 0;
        let mut abandoned = Vec::new();
        let mut blocked: HashSet<(CollectionName, RecordId)> = HashSet::new();

        for entry in entries {
            let key = (entry.collection.clone(), entry.target.clone());
            if blocked.contains(&key) {
                retained += 1;
                continue;
            }

            match self.push_entry(&entry).await {
                Ok(()) => pushed += 1,
                Err(e) if e.is_transient() => {
                    warn!(
                        collection = %entry.collection,
                        target = %entry.target,
                        "Entry retained after transient failure: {}", e
                    );
                    retained += 1;
                    blocked.insert(key);
                }
                Err(e) => {
                    error!(
                        collection = %entry.collection,
                        target = %entry.target,
                        "Abandoning undeliverable entry: {}", e
                    );
                    self.store.remove_entry(entry.id).await?;
                    let failure = SyncFailure {
                        entry: entry.id,
                        collection: entry.collection.clone(),
                        target: entry.target.clone(),
                        kind: entry.kind,
                        reason: e.to_string(),
                    };
                    let _ = self.events.send(SyncEvent::EntryRejected(failure.clone()));
                    abandoned.push(failure);
                    blocked.insert(key);
                }
            }
        }

        Ok((pushed, retained, abandoned))
    }

    /// Replay one entry and commit its confirmation atomically.
    async fn push_entry(&self, entry: &OutboxEntry) -> Result<()> {
        match entry.kind {
            OperationKind::Create => {
                let payload = entry.payload.as_ref().ok_or_else(|| {
                    Error::InvalidInput("Create entry carries no payload".to_string())
                })?;
                let confirmed = self
                    .retry
                    .execute(|| self.remote.create(&entry.collection, payload))
                    .await?;
                let record = Record {
                    id: RecordId::permanent(confirmed.id),
                    payload: confirmed.payload,
                    updated_at: Utc::now(),
                };
                match &entry.target {
                    // The id remap: the temporary id dies here, and any
                    // entry still queued behind this one is retargeted in
                    // the same transaction.
                    RecordId::Temporary(_) => {
                        self.store
                            .promote_record(&entry.collection, &entry.target, &record, entry.id)
                            .await
                    }
                    RecordId::Permanent(_) => {
                        self.store
                            .put_confirmed(&entry.collection, &record, entry.id)
                            .await
                    }
                }
            }
            OperationKind::Update => {
                if entry.target.is_temporary() {
                    // The create this update depended on was abandoned.
                    return Err(Error::InvalidInput(format!(
                        "Update targets unsynced record {}",
                        entry.target
                    )));
                }
                let payload = entry.payload.as_ref().ok_or_else(|| {
                    Error::InvalidInput("Update entry carries no payload".to_string())
                })?;
                let confirmed = self
                    .retry
                    .execute(|| {
                        self.remote
                            .update(&entry.collection, entry.target.as_str(), payload)
                    })
                    .await?;
                let record = Record {
                    id: RecordId::permanent(confirmed.id),
                    payload: confirmed.payload,
                    updated_at: Utc::now(),
                };
                self.store
                    .put_confirmed(&entry.collection, &record, entry.id)
                    .await
            }
            OperationKind::Delete => {
                if entry.target.is_temporary() {
                    return Err(Error::InvalidInput(format!(
                        "Delete targets unsynced record {}",
                        entry.target
                    )));
                }
                let result = self
                    .retry
                    .execute(|| self.remote.delete(&entry.collection, entry.target.as_str()))
                    .await;
                match result {
                    // Already gone remotely: the intended effect holds.
                    Ok(()) | Err(Error::NotFound(_)) => {
                        self.store.remove_entry(entry.id).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn pull_unlocked(&self, collection: &CollectionName) -> Result<usize> {
        self.collections.check(collection)?;

        let pending = self.store.pending_for(collection).await?;
        let preserve: HashSet<RecordId> = pending.into_iter().map(|e| e.target).collect();

        let snapshot = self
            .retry
            .execute(|| self.remote.fetch_all(collection))
            .await?;
        let records: Vec<Record> = snapshot
            .into_iter()
            .map(|r| Record::from_remote(r.id, r.payload))
            .collect();
        let count = records.len();

        self.store
            .replace_collection(collection, records, &preserve)
            .await?;
        debug!(%collection, pulled = count, preserved = preserve.len(), "Pulled snapshot");
        Ok(count)
    }
}
