//! Storage trait definition.

use async_trait::async_trait;
use std::collections::HashSet;

use satchel_common::{CollectionName, Record, RecordId, Result};

use crate::outbox::{EntryId, OperationKind, OutboxEntry};

/// Durable, versioned storage of collections plus the outbox of pending
/// mutations, independent of network state.
///
/// The sync algorithm never touches a storage-engine-specific API; backends
/// plug in behind this trait (in-memory for unit tests, sqlite for a durable
/// deployment).
///
/// Atomicity contract: every method documented as "one transaction" applies
/// all of its writes or none of them. A record mutation and the outbox entry
/// describing it must never be separated by a crash, and neither must an id
/// remap and the removal of the create entry that caused it.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name (e.g. "memory", "sqlite").
    fn name(&self) -> &str;

    /// Collections this store was opened with.
    fn collections(&self) -> &[CollectionName];

    /// All records of a collection.
    ///
    /// # Postconditions
    /// - An empty collection yields an empty vector, not an error
    async fn get_all(&self, collection: &CollectionName) -> Result<Vec<Record>>;

    /// Look up a record by id.
    ///
    /// # Postconditions
    /// - A missing record yields `None`, not an error
    async fn get(&self, collection: &CollectionName, id: &RecordId) -> Result<Option<Record>>;

    /// Upsert a record, keyed by its id. Last write wins locally.
    async fn put(&self, collection: &CollectionName, record: &Record) -> Result<()>;

    /// Remove a record. Removing a missing record is a no-op.
    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()>;

    /// Remove every record of a collection.
    async fn clear(&self, collection: &CollectionName) -> Result<()>;

    /// Upsert a record and append the outbox entry describing the mutation.
    /// One transaction.
    ///
    /// The entry's payload is the record payload for creates and updates.
    async fn put_with_entry(
        &self,
        collection: &CollectionName,
        record: &Record,
        kind: OperationKind,
    ) -> Result<EntryId>;

    /// Remove a record and append a Delete outbox entry. One transaction.
    async fn delete_with_entry(&self, collection: &CollectionName, id: &RecordId)
        -> Result<EntryId>;

    /// Remove a record together with every pending entry that targets it.
    /// One transaction.
    ///
    /// Used when a record that only ever existed locally is deleted before
    /// its create was confirmed: there is nothing to tell the remote.
    async fn discard_record(&self, collection: &CollectionName, id: &RecordId) -> Result<()>;

    /// All pending entries, ascending by creation time (entry id breaks
    /// ties).
    async fn pending_entries(&self) -> Result<Vec<OutboxEntry>>;

    /// Pending entries for one collection, in the same order.
    async fn pending_for(&self, collection: &CollectionName) -> Result<Vec<OutboxEntry>>;

    /// Remove a confirmed entry.
    ///
    /// Idempotent: removing an already-removed id is a no-op, so a retried
    /// acknowledgement cannot fail.
    async fn remove_entry(&self, id: EntryId) -> Result<()>;

    /// Whether any entry is still pending.
    async fn has_pending(&self) -> Result<bool>;

    /// Commit a confirmed create: replace the temporary record with the
    /// permanent one, retarget every remaining pending entry that referenced
    /// the temporary id, and remove the confirmed entry. One transaction.
    async fn promote_record(
        &self,
        collection: &CollectionName,
        temp: &RecordId,
        record: &Record,
        entry: EntryId,
    ) -> Result<()>;

    /// Commit a confirmed update: mirror the canonical record and remove the
    /// confirmed entry. One transaction.
    async fn put_confirmed(
        &self,
        collection: &CollectionName,
        record: &Record,
        entry: EntryId,
    ) -> Result<()>;

    /// Replace the local snapshot of a collection with a pulled one, leaving
    /// every record whose id is in `preserve` untouched (present records stay
    /// as they are, absent ones stay absent). One transaction.
    async fn replace_collection(
        &self,
        collection: &CollectionName,
        records: Vec<Record>,
        preserve: &HashSet<RecordId>,
    ) -> Result<()>;
}
