//! The persistence surface consumed by application code.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use satchel_common::{CollectionName, Collections, Error, Record, RecordId, Result};
use satchel_remote::RemoteApi;
use satchel_storage::{KeyValueStore, OperationKind};
use satchel_sync::ConnectivityMonitor;

/// The only entry point UI/application code uses for persistence.
///
/// Remote-first when the monitor reports online; any transient remote
/// failure falls back to the offline path, which mutates the store and
/// appends the outbox entry in one transaction. Declared-offline and
/// failed-while-online therefore leave identical local state, which is what
/// keeps behavior predictable under flaky connectivity.
///
/// Permanent remote errors (validation, authorization) propagate to the
/// caller: queueing them could only end in a later abandonment.
pub struct DataFacade {
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    collections: Collections,
}

impl DataFacade {
    /// Create a facade over the injected collaborators.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
        collections: Collections,
    ) -> Self {
        Self {
            store,
            remote,
            monitor,
            collections,
        }
    }

    /// Create a record.
    ///
    /// Online: the server assigns the permanent id and the result is
    /// mirrored locally. Offline path: the record exists locally under a
    /// temporary id until the next successful sync.
    pub async fn create(&self, collection: &CollectionName, payload: Value) -> Result<Record> {
        self.collections.check(collection)?;

        if self.monitor.is_online() {
            match self.remote.create(collection, &payload).await {
                Ok(confirmed) => {
                    let record = Record::from_remote(confirmed.id, confirmed.payload);
                    self.store.put(collection, &record).await?;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    debug!(%collection, "Remote create failed, using offline path: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let record = Record::new_local(payload);
        self.store
            .put_with_entry(collection, &record, OperationKind::Create)
            .await?;
        Ok(record)
    }

    /// All records of a collection.
    ///
    /// Online reads refresh the local snapshot first (pending edits win, as
    /// in a pull); either way the answer comes from the store.
    pub async fn get_all(&self, collection: &CollectionName) -> Result<Vec<Record>> {
        self.collections.check(collection)?;

        if self.monitor.is_online() {
            match self.remote.fetch_all(collection).await {
                Ok(snapshot) => {
                    let preserve = self.pending_ids(collection).await?;
                    let records = snapshot
                        .into_iter()
                        .map(|r| Record::from_remote(r.id, r.payload))
                        .collect();
                    self.store
                        .replace_collection(collection, records, &preserve)
                        .await?;
                }
                Err(e) if e.is_transient() => {
                    debug!(%collection, "Remote list failed, serving local: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        self.store.get_all(collection).await
    }

    /// Look up one record.
    pub async fn get_by_id(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<Option<Record>> {
        self.collections.check(collection)?;

        if self.monitor.is_online() && !id.is_temporary() {
            match self.remote.fetch(collection, id.as_str()).await {
                Ok(confirmed) => {
                    if !self.has_pending_for(collection, id).await? {
                        let record = Record::from_remote(confirmed.id, confirmed.payload);
                        self.store.put(collection, &record).await?;
                    }
                }
                Err(Error::NotFound(_)) => {
                    // Authoritatively absent; drop a stale mirror unless a
                    // local mutation is still in flight.
                    if !self.has_pending_for(collection, id).await? {
                        self.store.delete(collection, id).await?;
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(%collection, "Remote fetch failed, serving local: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        self.store.get(collection, id).await
    }

    /// Replace a record's payload (last writer wins).
    pub async fn update(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Value,
    ) -> Result<Record> {
        self.collections.check(collection)?;

        // A temporary id is unknown to the server; the update queues behind
        // the pending create and is retargeted when the create confirms.
        if self.monitor.is_online() && !id.is_temporary() {
            match self.remote.update(collection, id.as_str(), &payload).await {
                Ok(confirmed) => {
                    let record = Record::from_remote(confirmed.id, confirmed.payload);
                    self.store.put(collection, &record).await?;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    debug!(%collection, target = %id, "Remote update failed, using offline path: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let record = Record {
            id: id.clone(),
            payload,
            updated_at: Utc::now(),
        };
        self.store
            .put_with_entry(collection, &record, OperationKind::Update)
            .await?;
        Ok(record)
    }

    /// Delete a record.
    pub async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.collections.check(collection)?;

        if id.is_temporary() {
            // Never reached the server; nothing to replay.
            return self.store.discard_record(collection, id).await;
        }

        if self.monitor.is_online() {
            match self.remote.delete(collection, id.as_str()).await {
                Ok(()) | Err(Error::NotFound(_)) => {
                    return self.store.delete(collection, id).await;
                }
                Err(e) if e.is_transient() => {
                    debug!(%collection, target = %id, "Remote delete failed, using offline path: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        self.store.delete_with_entry(collection, id).await?;
        Ok(())
    }

    async fn pending_ids(&self, collection: &CollectionName) -> Result<HashSet<RecordId>> {
        Ok(self
            .store
            .pending_for(collection)
            .await?
            .into_iter()
            .map(|e| e.target)
            .collect())
    }

    async fn has_pending_for(&self, collection: &CollectionName, id: &RecordId) -> Result<bool> {
        Ok(self
            .store
            .pending_for(collection)
            .await?
            .iter()
            .any(|e| &e.target == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_common::CollectionSpec;
    use satchel_remote::MemoryRemote;
    use satchel_storage::MemoryStore;
    use serde_json::json;

    fn products() -> CollectionName {
        CollectionName::new("products").unwrap()
    }

    fn setup() -> (DataFacade, Arc<MemoryStore>, Arc<MemoryRemote>, ConnectivityMonitor) {
        let store = Arc::new(MemoryStore::new(vec![products()]));
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::online();
        let collections =
            Collections::new(vec![CollectionSpec::new(products(), "api/products")]).unwrap();
        let facade = DataFacade::new(store.clone(), remote.clone(), monitor.clone(), collections);
        (facade, store, remote, monitor)
    }

    #[tokio::test]
    async fn test_online_create_mirrors_without_entry() {
        let (facade, store, remote, _monitor) = setup();

        let record = facade
            .create(&products(), json!({"name": "Widget"}))
            .await
            .unwrap();

        assert!(!record.id.is_temporary());
        assert!(!store.has_pending().await.unwrap());
        assert_eq!(remote.snapshot(&products()).len(), 1);
        assert!(store.get(&products(), &record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_create_queues_with_temp_id() {
        let (facade, store, remote, monitor) = setup();
        monitor.set_online(false);

        let record = facade
            .create(&products(), json!({"name": "Widget", "qty": 5}))
            .await
            .unwrap();

        assert!(record.id.is_temporary());
        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Create);
        assert!(remote.snapshot(&products()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_while_online_matches_declared_offline() {
        let (facade, store, remote, _monitor) = setup();

        // Online but the request fails transiently.
        remote.fail_requests(1);
        let record = facade
            .create(&products(), json!({"name": "Widget"}))
            .await
            .unwrap();

        // Same local state the declared-offline path produces.
        assert!(record.id.is_temporary());
        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Create);
        assert_eq!(pending[0].target, record.id);
    }

    #[tokio::test]
    async fn test_permanent_remote_error_propagates() {
        let (facade, store, remote, _monitor) = setup();
        remote.set_reject_writes(true);

        let result = facade.create(&products(), json!({"name": ""})).await;
        assert!(matches!(result, Err(Error::Api { status: 422, .. })));
        // Nothing was queued for a mutation that can never be delivered.
        assert!(store.get_all(&products()).await.unwrap().is_empty());
        assert!(!store.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_collection_is_synchronous_error() {
        let (facade, _store, _remote, _monitor) = setup();
        let unknown = CollectionName::new("gadgets").unwrap();
        assert!(matches!(
            facade.create(&unknown, json!({})).await,
            Err(Error::UnknownCollection(_))
        ));
    }

    #[tokio::test]
    async fn test_online_update_then_unreachable_delete() {
        let (facade, store, remote, _monitor) = setup();

        let id = remote.seed(&products(), json!({"name": "Acme", "phone": "000"}));
        let record_id = RecordId::permanent(id);

        // Online update succeeds remotely: no outbox entry.
        facade
            .update(&products(), &record_id, json!({"name": "Acme", "phone": "123"}))
            .await
            .unwrap();
        assert!(!store.has_pending().await.unwrap());
        assert_eq!(remote.snapshot(&products())[0].payload["phone"], "123");

        // Server unreachable: the delete takes the offline path.
        remote.set_reachable(false);
        facade.delete(&products(), &record_id).await.unwrap();

        assert!(store.get(&products(), &record_id).await.unwrap().is_none());
        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Delete);
        assert_eq!(pending[0].target, record_id);
    }

    #[tokio::test]
    async fn test_update_of_unsynced_record_queues_behind_create() {
        let (facade, store, _remote, monitor) = setup();
        monitor.set_online(false);
        let record = facade
            .create(&products(), json!({"name": "Widget", "qty": 1}))
            .await
            .unwrap();

        monitor.set_online(true);
        // Still temporary: the update must queue, not hit the server.
        facade
            .update(&products(), &record.id, json!({"name": "Widget", "qty": 2}))
            .await
            .unwrap();

        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, OperationKind::Create);
        assert_eq!(pending[1].kind, OperationKind::Update);
        assert_eq!(pending[1].target, record.id);
    }

    #[tokio::test]
    async fn test_delete_of_unsynced_record_discards_queue() {
        let (facade, store, _remote, monitor) = setup();
        monitor.set_online(false);

        let record = facade
            .create(&products(), json!({"name": "Widget"}))
            .await
            .unwrap();
        facade.delete(&products(), &record.id).await.unwrap();

        assert!(store.get(&products(), &record.id).await.unwrap().is_none());
        assert!(!store.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_serves_local_when_offline() {
        let (facade, store, _remote, monitor) = setup();
        let record = Record::new_local(json!({"name": "Widget"}));
        store.put(&products(), &record).await.unwrap();

        monitor.set_online(false);
        let all = facade.get_all(&products()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_get_all_online_refresh_preserves_pending_edit() {
        let (facade, store, remote, _monitor) = setup();

        let id = remote.seed(&products(), json!({"name": "Widget", "qty": 1}));
        let record_id = RecordId::permanent(id);
        store
            .put(&products(), &Record::from_remote(record_id.as_str(), json!({"name": "Widget", "qty": 1})))
            .await
            .unwrap();

        // Pending local edit, then the server side changes too.
        remote.set_reachable(false);
        facade
            .update(&products(), &record_id, json!({"name": "Widget", "qty": 42}))
            .await
            .unwrap();
        remote.set_reachable(true);

        let all = facade.get_all(&products()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload["qty"], 42);
    }

    #[tokio::test]
    async fn test_get_by_id_mirrors_remote() {
        let (facade, store, remote, _monitor) = setup();
        let id = remote.seed(&products(), json!({"name": "Widget"}));
        let record_id = RecordId::permanent(id);

        let found = facade.get_by_id(&products(), &record_id).await.unwrap();
        assert!(found.is_some());
        assert!(store.get(&products(), &record_id).await.unwrap().is_some());
    }
}
