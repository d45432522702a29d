//! Sync scheduling: explicit requests, periodic runs, reconnect triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use satchel_common::{CollectionName, Error, Result};

use crate::connectivity::ConnectivityMonitor;
use crate::engine::{SyncEngine, SyncReport};
use crate::retry::RetryPolicy;

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Push everything pending, then pull all collections.
    Full,
    /// Pull one collection.
    Pull(CollectionName),
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Handle for requesting syncs from the running worker.
///
/// Requests are serviced one at a time by the worker loop; the bounded
/// channel means a burst of triggers queues briefly instead of stacking
/// concurrent cycles.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler and its worker.
    ///
    /// `auto_interval` enables periodic syncs; `None` leaves only explicit
    /// requests and reconnect triggers. The worker must be spawned by the
    /// caller.
    pub fn new(
        engine: Arc<SyncEngine>,
        monitor: ConnectivityMonitor,
        auto_interval: Option<Duration>,
        backoff: RetryPolicy,
    ) -> (Self, SyncSchedulerWorker) {
        let (request_tx, request_rx) = mpsc::channel(16);

        let scheduler = Self { request_tx };
        let worker = SyncSchedulerWorker {
            engine,
            monitor,
            auto_interval,
            backoff,
            request_rx,
        };
        (scheduler, worker)
    }

    /// Request a full sync and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Full).await
    }

    /// Request a pull of one collection and wait for its report.
    pub async fn request_pull(&self, collection: CollectionName) -> Result<SyncReport> {
        self.request(SyncRequest::Pull(collection)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((request, reply_tx))
            .await
            .map_err(|_| Error::SyncUnavailable("Scheduler not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::SyncUnavailable("No sync result received".to_string()))?
    }

    /// Stop the worker.
    pub async fn shutdown(&self) {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = self.request_tx.send((SyncRequest::Shutdown, reply_tx)).await;
    }
}

/// Background task servicing sync triggers.
///
/// One loop handles explicit requests, the periodic tick and connectivity
/// transitions, so cycles can never overlap. Periodic runs back off
/// exponentially while cycles keep failing and return to the configured
/// cadence on the first clean one.
pub struct SyncSchedulerWorker {
    engine: Arc<SyncEngine>,
    monitor: ConnectivityMonitor,
    auto_interval: Option<Duration>,
    backoff: RetryPolicy,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
}

impl SyncSchedulerWorker {
    /// Run the scheduler loop. Spawn this in a tokio task.
    pub async fn run(self) {
        let SyncSchedulerWorker {
            engine,
            monitor,
            auto_interval,
            backoff,
            mut request_rx,
        } = self;

        let mut conn_rx = monitor.subscribe();
        let mut ticker = auto_interval.map(|every| {
            let mut t = interval(every);
            // A tick missed while a cycle runs must not burst afterwards.
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });
        let mut failures: u32 = 0;
        let mut hold_until: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some((request, reply)) = request else { break };
                    match request {
                        SyncRequest::Shutdown => {
                            info!("Received shutdown request");
                            let _ = reply.send(Ok(SyncReport::default()));
                            break;
                        }
                        SyncRequest::Full => {
                            debug!("Processing explicit sync request");
                            let result = engine.force_sync().await;
                            Self::note_outcome(&result, &backoff, &mut failures, &mut hold_until);
                            let _ = reply.send(result);
                        }
                        SyncRequest::Pull(collection) => {
                            debug!(%collection, "Processing pull request");
                            let result = engine.pull_remote(&collection).await.map(|pulled| {
                                SyncReport { pulled, ..SyncReport::default() }
                            });
                            let _ = reply.send(result);
                        }
                    }
                }

                _ = Self::next_tick(&mut ticker) => {
                    if !monitor.is_online() {
                        debug!("Periodic sync skipped; offline");
                        continue;
                    }
                    if hold_until.is_some_and(|until| Instant::now() < until) {
                        debug!("Periodic sync skipped; backing off");
                        continue;
                    }
                    debug!("Triggering periodic sync");
                    let result = engine.force_sync().await;
                    if let Err(e) = &result {
                        error!("Periodic sync failed: {}", e);
                    }
                    Self::note_outcome(&result, &backoff, &mut failures, &mut hold_until);
                }

                _ = conn_rx.changed() => {
                    if *conn_rx.borrow_and_update() {
                        info!("Connectivity restored; syncing immediately");
                        let result = engine.force_sync().await;
                        if let Err(e) = &result {
                            error!("Post-reconnect sync failed: {}", e);
                        }
                        Self::note_outcome(&result, &backoff, &mut failures, &mut hold_until);
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    fn note_outcome(
        result: &Result<SyncReport>,
        backoff: &RetryPolicy,
        failures: &mut u32,
        hold_until: &mut Option<Instant>,
    ) {
        match result {
            Ok(report) if report.is_clean() => {
                *failures = 0;
                *hold_until = None;
            }
            // Offline cycles are not a failure streak; the reconnect
            // trigger covers them.
            Ok(report) if report.offline => {
                *hold_until = None;
            }
            _ => {
                *failures = failures.saturating_add(1);
                let delay = backoff.delay_for_attempt(failures.saturating_sub(1));
                *hold_until = Some(Instant::now() + delay);
                debug!(?delay, streak = *failures, "Backing off before next periodic sync");
            }
        }
    }

    async fn next_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(t) => {
                t.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_common::{CollectionName, CollectionSpec, Collections, Record};
    use satchel_remote::MemoryRemote;
    use satchel_storage::{KeyValueStore, MemoryStore, OperationKind};
    use serde_json::json;

    fn products() -> CollectionName {
        CollectionName::new("products").unwrap()
    }

    fn test_policy() -> RetryPolicy {
        RetryPolicy::new(0)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    fn setup(
        monitor: ConnectivityMonitor,
    ) -> (Arc<SyncEngine>, Arc<MemoryStore>, Arc<MemoryRemote>) {
        let store = Arc::new(MemoryStore::new(vec![products()]));
        let remote = Arc::new(MemoryRemote::new());
        let collections =
            Collections::new(vec![CollectionSpec::new(products(), "api/products")]).unwrap();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            monitor,
            collections,
            test_policy(),
        ));
        (engine, store, remote)
    }

    async fn wait_until_drained(store: &MemoryStore) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.has_pending().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox never drained");
    }

    #[tokio::test]
    async fn test_explicit_request_roundtrip() {
        let monitor = ConnectivityMonitor::online();
        let (engine, store, _remote) = setup(monitor.clone());
        let record = Record::new_local(json!({"name": "Widget"}));
        store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        let (scheduler, worker) = SyncScheduler::new(engine, monitor, None, test_policy());
        let worker_task = tokio::spawn(worker.run());

        let report = scheduler.request_sync().await.unwrap();
        assert_eq!(report.pushed, 1);

        scheduler.shutdown().await;
        let _ = worker_task.await;
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails() {
        let monitor = ConnectivityMonitor::online();
        let (engine, _store, _remote) = setup(monitor.clone());

        let (scheduler, worker) = SyncScheduler::new(engine, monitor, None, test_policy());
        let worker_task = tokio::spawn(worker.run());

        scheduler.shutdown().await;
        let _ = worker_task.await;

        assert!(matches!(
            scheduler.request_sync().await,
            Err(Error::SyncUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_immediate_sync() {
        let monitor = ConnectivityMonitor::new(false);
        let (engine, store, _remote) = setup(monitor.clone());
        let record = Record::new_local(json!({"name": "Widget"}));
        store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        let (scheduler, worker) = SyncScheduler::new(engine, monitor.clone(), None, test_policy());
        let worker_task = tokio::spawn(worker.run());

        // Still pending while offline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.has_pending().await.unwrap());

        monitor.set_online(true);
        wait_until_drained(&store).await;

        scheduler.shutdown().await;
        let _ = worker_task.await;
    }

    #[test]
    fn test_backoff_grows_with_failures_and_resets() {
        let backoff = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);
        let mut failures = 0;
        let mut hold_until = None;

        let dirty = Ok(SyncReport {
            retained: 1,
            ..SyncReport::default()
        });
        SyncSchedulerWorker::note_outcome(&dirty, &backoff, &mut failures, &mut hold_until);
        assert_eq!(failures, 1);
        assert!(hold_until.is_some());

        SyncSchedulerWorker::note_outcome(&dirty, &backoff, &mut failures, &mut hold_until);
        assert_eq!(failures, 2);

        // Offline cycles clear the hold without extending the streak.
        let offline = Ok(SyncReport {
            offline: true,
            retained: 1,
            ..SyncReport::default()
        });
        SyncSchedulerWorker::note_outcome(&offline, &backoff, &mut failures, &mut hold_until);
        assert_eq!(failures, 2);
        assert!(hold_until.is_none());

        // A clean cycle resets everything.
        let clean = Ok(SyncReport::default());
        SyncSchedulerWorker::note_outcome(&clean, &backoff, &mut failures, &mut hold_until);
        assert_eq!(failures, 0);
        assert!(hold_until.is_none());
    }

    #[tokio::test]
    async fn test_periodic_sync_drains_outbox() {
        let monitor = ConnectivityMonitor::online();
        let (engine, store, _remote) = setup(monitor.clone());
        let record = Record::new_local(json!({"name": "Widget"}));
        store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        let (scheduler, worker) = SyncScheduler::new(
            engine,
            monitor,
            Some(Duration::from_millis(20)),
            test_policy(),
        );
        let worker_task = tokio::spawn(worker.run());

        wait_until_drained(&store).await;

        scheduler.shutdown().await;
        let _ = worker_task.await;
    }
}
