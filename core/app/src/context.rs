//! Engine construction root.
//!
//! One `SyncContext` owns one engine instance and its collaborators; there
//! is no implicit global database handle or outbox anywhere. Tests build as
//! many contexts as they need, each fully isolated.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use satchel_common::{Error, Result};
use satchel_remote::{HttpRemote, RemoteApi, TokenSource};
use satchel_storage::{KeyValueStore, SqliteStore};
use satchel_sync::{
    ConnectivityMonitor, SyncEngine, SyncScheduler, SyncSchedulerWorker,
};

use crate::config::EngineConfig;
use crate::facade::DataFacade;

/// One engine instance: store, remote client, monitor, engine, facade and
/// scheduler, wired together from an `EngineConfig`.
pub struct SyncContext {
    config: EngineConfig,
    remote: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
    facade: Arc<DataFacade>,
    scheduler: SyncScheduler,
    worker: Option<SyncSchedulerWorker>,
    worker_task: Option<JoinHandle<()>>,
    prober_task: Option<JoinHandle<()>>,
}

impl SyncContext {
    /// Build a context from injected storage and network clients.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Self> {
        let collections = config.collection_set()?;
        let monitor = ConnectivityMonitor::online();

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            collections.clone(),
            config.retry.clone(),
        ));
        let facade = Arc::new(DataFacade::new(
            store,
            remote.clone(),
            monitor.clone(),
            collections,
        ));
        let (scheduler, worker) = SyncScheduler::new(
            engine.clone(),
            monitor.clone(),
            config.auto_sync_interval,
            config.retry.clone(),
        );

        Ok(Self {
            config,
            remote,
            monitor,
            engine,
            facade,
            scheduler,
            worker: Some(worker),
            worker_task: None,
            prober_task: None,
        })
    }

    /// Build a context over the durable sqlite store and the HTTP remote.
    pub fn open(
        config: EngineConfig,
        db_path: impl AsRef<Path>,
        token: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let collections = config.collection_set()?;
        let store = Arc::new(SqliteStore::open(db_path, collections.names())?);
        let remote = Arc::new(HttpRemote::new(
            &config.base_url,
            collections,
            token,
            config.request_timeout,
        )?);
        Self::new(config, store, remote)
    }

    /// The persistence surface for application code.
    pub fn facade(&self) -> Arc<DataFacade> {
        self.facade.clone()
    }

    /// The sync engine, for direct push/pull control.
    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    /// The connectivity monitor.
    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// The scheduler handle for explicit sync requests.
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Spawn the scheduler worker and, when configured, the reachability
    /// prober.
    pub fn start(&mut self) -> Result<()> {
        let worker = self.worker.take().ok_or_else(|| {
            Error::SyncUnavailable("Context already started".to_string())
        })?;
        self.worker_task = Some(tokio::spawn(worker.run()));
        if let Some(every) = self.config.probe_interval {
            self.prober_task = Some(self.monitor.spawn_prober(self.remote.clone(), every));
        }
        info!("Sync context started");
        Ok(())
    }

    /// Stop background work. The worker finishes its in-flight cycle before
    /// exiting; the prober is simply cancelled.
    pub async fn stop(&mut self) {
        self.scheduler.shutdown().await;
        if let Some(task) = self.worker_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.prober_task.take() {
            task.abort();
        }
        info!("Sync context stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_common::{CollectionName, CollectionSpec};
    use satchel_remote::MemoryRemote;
    use satchel_storage::MemoryStore;
    use satchel_sync::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn products() -> CollectionName {
        CollectionName::new("products").unwrap()
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::new(
            "http://localhost:4000/",
            vec![CollectionSpec::new(products(), "api/products")],
        );
        config.retry = RetryPolicy::new(0)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        config
    }

    fn context() -> (SyncContext, Arc<MemoryStore>, Arc<MemoryRemote>) {
        let store = Arc::new(MemoryStore::new(vec![products()]));
        let remote = Arc::new(MemoryRemote::new());
        let context = SyncContext::new(config(), store.clone(), remote.clone()).unwrap();
        (context, store, remote)
    }

    #[tokio::test]
    async fn test_offline_edits_converge_after_reconnect() {
        let (mut context, store, remote) = context();
        context.start().unwrap();
        let facade = context.facade();

        context.monitor().set_online(false);
        let widget = facade
            .create(&products(), json!({"name": "Widget", "qty": 5}))
            .await
            .unwrap();
        assert!(widget.id.is_temporary());
        assert!(store.has_pending().await.unwrap());

        // Reconnecting alone triggers the sync; no explicit request needed.
        context.monitor().set_online(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.has_pending().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox never drained");

        let all = facade.get_all(&products()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].id.is_temporary());
        assert_eq!(remote.snapshot(&products()).len(), 1);

        context.stop().await;
    }

    #[tokio::test]
    async fn test_explicit_sync_through_scheduler() {
        let (mut context, store, _remote) = context();
        context.start().unwrap();

        context.monitor().set_online(false);
        context
            .facade()
            .create(&products(), json!({"name": "Widget"}))
            .await
            .unwrap();
        context.monitor().set_online(true);

        let report = context.scheduler().request_sync().await.unwrap();
        // Either the reconnect trigger or this request drained the outbox;
        // in both cases the entry went over the wire exactly once.
        assert!(report.pushed <= 1);
        assert!(!store.has_pending().await.unwrap());

        context.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (mut context, _store, _remote) = context();
        context.start().unwrap();
        assert!(context.start().is_err());
        context.stop().await;
    }

    #[tokio::test]
    async fn test_open_durable_context_survives_restart() {
        use satchel_remote::StaticToken;

        let temp = tempfile::TempDir::new().unwrap();
        let db = temp.path().join("satchel.db");
        let token: Arc<dyn TokenSource> = Arc::new(StaticToken::new("secret"));
        // Nothing listens on port 9; every remote attempt fails transiently
        // and the facade takes the offline path.
        let mut config = config();
        config.base_url = "http://127.0.0.1:9/".to_string();

        let record_id = {
            let context = SyncContext::open(config.clone(), &db, token.clone()).unwrap();
            let record = context
                .facade()
                .create(&products(), json!({"name": "Widget"}))
                .await
                .unwrap();
            assert!(record.id.is_temporary());
            record.id
        };

        let context = SyncContext::open(config, &db, token).unwrap();
        let found = context
            .facade()
            .get_by_id(&products(), &record_id)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_invalid_collection_config_fails_construction() {
        let store = Arc::new(MemoryStore::new(vec![products()]));
        let remote = Arc::new(MemoryRemote::new());
        let mut bad = config();
        bad.collections.push(CollectionSpec::new(products(), "api/products-v2"));
        assert!(SyncContext::new(bad, store, remote).is_err());
    }
}
