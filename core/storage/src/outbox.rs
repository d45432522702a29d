//! Outbox entry types.
//!
//! The outbox is the ordered durable log of mutations the remote API has not
//! yet confirmed. It is the sole artifact bridging local truth and remote
//! truth while they diverge: an entry is created in the same transaction as
//! the record mutation it describes, and destroyed only once the remote has
//! durably accepted the operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use satchel_common::{CollectionName, Error, RecordId, Result};

/// Opaque identifier of an outbox entry (auto-incremented by the store).
pub type EntryId = i64;

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// New record to create remotely.
    Create,
    /// Existing record modified (full replacement).
    Update,
    /// Record to delete remotely.
    Delete,
}

impl OperationKind {
    /// Stable string form, as persisted by the sqlite backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Storage(format!("Unknown operation kind: {}", other))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One pending mutation awaiting remote confirmation.
///
/// Entries targeting the same record replay in `created_at` order (entry id
/// breaks ties); cross-record order carries no guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Store-assigned entry id.
    pub id: EntryId,
    /// What to replay against the remote API.
    pub kind: OperationKind,
    /// Collection the target record belongs to.
    pub collection: CollectionName,
    /// Identity of the target record at the time the entry was written.
    pub target: RecordId,
    /// Payload to send (absent for deletes).
    pub payload: Option<Value>,
    /// When the local mutation happened.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
            assert_eq!(OperationKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(OperationKind::parse("upsert").is_err());
    }
}
