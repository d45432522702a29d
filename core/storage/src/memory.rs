//! In-memory store backend for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use satchel_common::{CollectionName, Error, Record, RecordId, Result};

use crate::outbox::{EntryId, OperationKind, OutboxEntry};
use crate::store::KeyValueStore;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<CollectionName, HashMap<RecordId, Record>>,
    outbox: Vec<OutboxEntry>,
    next_entry_id: EntryId,
}

/// In-memory store.
///
/// All data is lost on drop. Holding the single write lock across every
/// compound operation is what makes the mutation+outbox pairs atomic here.
pub struct MemoryStore {
    collections: Vec<CollectionName>,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store for the given collections.
    pub fn new(collections: Vec<CollectionName>) -> Self {
        let mut inner = Inner {
            next_entry_id: 1,
            ..Inner::default()
        };
        for collection in &collections {
            inner.records.insert(collection.clone(), HashMap::new());
        }
        Self {
            collections,
            inner: RwLock::new(inner),
        }
    }

    fn check(&self, collection: &CollectionName) -> Result<()> {
        if self.collections.contains(collection) {
            Ok(())
        } else {
            Err(Error::UnknownCollection(collection.to_string()))
        }
    }
}

impl Inner {
    fn append(
        &mut self,
        collection: &CollectionName,
        kind: OperationKind,
        target: RecordId,
        payload: Option<serde_json::Value>,
    ) -> EntryId {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        self.outbox.push(OutboxEntry {
            id,
            kind,
            collection: collection.clone(),
            target,
            payload,
            created_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn collections(&self) -> &[CollectionName] {
        &self.collections
    }

    async fn get_all(&self, collection: &CollectionName) -> Result<Vec<Record>> {
        self.check(collection)?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .records
            .get(collection)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, collection: &CollectionName, id: &RecordId) -> Result<Option<Record>> {
        self.check(collection)?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .records
            .get(collection)
            .and_then(|m| m.get(id))
            .cloned())
    }

    async fn put(&self, collection: &CollectionName, record: &Record) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .records
            .entry(collection.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(map) = inner.records.get_mut(collection) {
            map.remove(id);
        }
        Ok(())
    }

    async fn clear(&self, collection: &CollectionName) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(map) = inner.records.get_mut(collection) {
            map.clear();
        }
        Ok(())
    }

    async fn put_with_entry(
        &self,
        collection: &CollectionName,
        record: &Record,
        kind: OperationKind,
    ) -> Result<EntryId> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .records
            .entry(collection.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(inner.append(
            collection,
            kind,
            record.id.clone(),
            Some(record.payload.clone()),
        ))
    }

    async fn delete_with_entry(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<EntryId> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(map) = inner.records.get_mut(collection) {
            map.remove(id);
        }
        Ok(inner.append(collection, OperationKind::Delete, id.clone(), None))
    }

    async fn discard_record(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(map) = inner.records.get_mut(collection) {
            map.remove(id);
        }
        inner
            .outbox
            .retain(|e| !(&e.collection == collection && &e.target == id));
        Ok(())
    }

    async fn pending_entries(&self) -> Result<Vec<OutboxEntry>> {
        let inner = self.inner.read().unwrap();
        let mut entries = inner.outbox.clone();
        entries.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(entries)
    }

    async fn pending_for(&self, collection: &CollectionName) -> Result<Vec<OutboxEntry>> {
        self.check(collection)?;
        Ok(self
            .pending_entries()
            .await?
            .into_iter()
            .filter(|e| &e.collection == collection)
            .collect())
    }

    async fn remove_entry(&self, id: EntryId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.outbox.retain(|e| e.id != id);
        Ok(())
    }

    async fn has_pending(&self) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(!inner.outbox.is_empty())
    }

    async fn promote_record(
        &self,
        collection: &CollectionName,
        temp: &RecordId,
        record: &Record,
        entry: EntryId,
    ) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(map) = inner.records.get_mut(collection) {
            map.remove(temp);
            map.insert(record.id.clone(), record.clone());
        }
        let permanent = record.id.clone();
        for pending in inner.outbox.iter_mut() {
            if &pending.collection == collection && &pending.target == temp {
                pending.target = permanent.clone();
            }
        }
        inner.outbox.retain(|e| e.id != entry);
        Ok(())
    }

    async fn put_confirmed(
        &self,
        collection: &CollectionName,
        record: &Record,
        entry: EntryId,
    ) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .records
            .entry(collection.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        inner.outbox.retain(|e| e.id != entry);
        Ok(())
    }

    async fn replace_collection(
        &self,
        collection: &CollectionName,
        records: Vec<Record>,
        preserve: &HashSet<RecordId>,
    ) -> Result<()> {
        self.check(collection)?;
        let mut inner = self.inner.write().unwrap();
        let map = inner.records.entry(collection.clone()).or_default();
        map.retain(|id, _| preserve.contains(id));
        for record in records {
            if !preserve.contains(&record.id) {
                map.insert(record.id.clone(), record);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(vec![
            CollectionName::new("products").unwrap(),
            CollectionName::new("clients").unwrap(),
        ])
    }

    fn products() -> CollectionName {
        CollectionName::new("products").unwrap()
    }

    #[tokio::test]
    async fn test_empty_reads() {
        let store = store();
        assert!(store.get_all(&products()).await.unwrap().is_empty());
        let id = RecordId::permanent("1");
        assert!(store.get(&products(), &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_collection_rejected() {
        let store = store();
        let unknown = CollectionName::new("gadgets").unwrap();
        assert!(matches!(
            store.get_all(&unknown).await,
            Err(Error::UnknownCollection(_))
        ));
    }

    #[tokio::test]
    async fn test_put_with_entry_is_paired() {
        let store = store();
        let record = Record::new_local(json!({"name": "Widget", "qty": 5}));
        store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        assert_eq!(store.get_all(&products()).await.unwrap().len(), 1);
        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Create);
        assert_eq!(pending[0].target, record.id);
    }

    #[tokio::test]
    async fn test_remove_entry_is_idempotent() {
        let store = store();
        let record = Record::new_local(json!({"name": "Widget"}));
        let entry = store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        store.remove_entry(entry).await.unwrap();
        assert!(!store.has_pending().await.unwrap());
        // Second removal is a no-op, not an error.
        store.remove_entry(entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_promote_swaps_id_and_retargets() {
        let store = store();
        let record = Record::new_local(json!({"name": "Widget"}));
        let temp = record.id.clone();
        let create = store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();

        // An update queued behind the create still targets the temp id.
        let mut updated = record.clone();
        updated.payload = json!({"name": "Widget v2"});
        store
            .put_with_entry(&products(), &updated, OperationKind::Update)
            .await
            .unwrap();

        let permanent = Record::from_remote("srv-1", json!({"name": "Widget"}));
        store
            .promote_record(&products(), &temp, &permanent, create)
            .await
            .unwrap();

        // Old id gone, new id resolvable.
        assert!(store.get(&products(), &temp).await.unwrap().is_none());
        assert!(store
            .get(&products(), &permanent.id)
            .await
            .unwrap()
            .is_some());

        // The queued update now targets the permanent id.
        let pending = store.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Update);
        assert_eq!(pending[0].target, permanent.id);
    }

    #[tokio::test]
    async fn test_discard_record_drops_entries() {
        let store = store();
        let record = Record::new_local(json!({"name": "Widget"}));
        store
            .put_with_entry(&products(), &record, OperationKind::Create)
            .await
            .unwrap();
        store
            .put_with_entry(&products(), &record, OperationKind::Update)
            .await
            .unwrap();

        store.discard_record(&products(), &record.id).await.unwrap();
        assert!(store.get(&products(), &record.id).await.unwrap().is_none());
        assert!(!store.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_collection_preserves_pending_ids() {
        let store = store();
        let synced = Record::from_remote("srv-1", json!({"name": "Widget"}));
        store.put(&products(), &synced).await.unwrap();

        let mut edited = synced.clone();
        edited.payload = json!({"name": "Widget (renamed)"});
        store
            .put_with_entry(&products(), &edited, OperationKind::Update)
            .await
            .unwrap();

        // The pulled snapshot carries the stale remote version plus a new row.
        let pulled = vec![
            Record::from_remote("srv-1", json!({"name": "Widget"})),
            Record::from_remote("srv-2", json!({"name": "Gizmo"})),
        ];
        let preserve: HashSet<RecordId> = [edited.id.clone()].into();
        store
            .replace_collection(&products(), pulled, &preserve)
            .await
            .unwrap();

        let kept = store.get(&products(), &edited.id).await.unwrap().unwrap();
        assert_eq!(kept.payload["name"], "Widget (renamed)");
        assert!(store
            .get(&products(), &RecordId::permanent("srv-2"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_replace_collection_does_not_resurrect_deleted() {
        let store = store();
        let synced = Record::from_remote("srv-1", json!({"name": "Widget"}));
        store.put(&products(), &synced).await.unwrap();
        store.delete_with_entry(&products(), &synced.id).await.unwrap();

        let pulled = vec![Record::from_remote("srv-1", json!({"name": "Widget"}))];
        let preserve: HashSet<RecordId> = [synced.id.clone()].into();
        store
            .replace_collection(&products(), pulled, &preserve)
            .await
            .unwrap();

        // Still deleted locally; the delete is pending, not forgotten.
        assert!(store.get(&products(), &synced.id).await.unwrap().is_none());
        assert!(store.has_pending().await.unwrap());
    }

    mod ordering {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Entries appended for interleaved records always replay in
            // per-record append order.
            #[test]
            fn prop_per_record_order(ops in prop::collection::vec((0usize..4, 0u8..2), 1..32)) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let store = store();
                    let ids: Vec<RecordId> =
                        (0..4).map(|i| RecordId::permanent(format!("r{}", i))).collect();
                    let mut appended: Vec<Vec<EntryId>> = vec![Vec::new(); 4];

                    for (slot, kind) in ops {
                        let record = Record {
                            id: ids[slot].clone(),
                            payload: json!({"slot": slot}),
                            updated_at: Utc::now(),
                        };
                        let kind = if kind == 0 { OperationKind::Create } else { OperationKind::Update };
                        let entry = store
                            .put_with_entry(&products(), &record, kind)
                            .await
                            .unwrap();
                        appended[slot].push(entry);
                    }

                    let pending = store.pending_entries().await.unwrap();
                    for (slot, id) in ids.iter().enumerate() {
                        let replayed: Vec<EntryId> = pending
                            .iter()
                            .filter(|e| &e.target == id)
                            .map(|e| e.id)
                            .collect();
                        prop_assert_eq!(&replayed, &appended[slot]);
                    }
                    Ok(())
                })?;
            }
        }
    }
}
