//! Common types used throughout Satchel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Name of a configured record collection (e.g. "products", "clients").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new CollectionName from a string.
    ///
    /// # Preconditions
    /// - `name` must be non-empty and must not contain path separators
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains '/'
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.contains('/') {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot contain '/'".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a record.
///
/// A record created while the remote is unreachable carries a client-minted
/// `Temporary` id until its create is confirmed; the server response then
/// assigns the `Permanent` id. A record never holds both: the swap is a
/// single atomic replacement in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RecordId {
    /// Client-minted id, valid only until the first successful sync.
    Temporary(String),
    /// Server-assigned id.
    Permanent(String),
}

impl RecordId {
    /// Mint a fresh temporary id.
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4().to_string())
    }

    /// Wrap a server-assigned id.
    pub fn permanent(id: impl Into<String>) -> Self {
        Self::Permanent(id.into())
    }

    /// Whether this id is still client-minted.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Get the inner id string, regardless of variant.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Temporary(s) | Self::Permanent(s) => s,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(s) => write!(f, "tmp:{}", s),
            Self::Permanent(s) => write!(f, "{}", s),
        }
    }
}

/// A single entity instance belonging to exactly one collection.
///
/// The payload is carried opaque: the engine synchronizes documents, it does
/// not interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity, temporary or permanent.
    pub id: RecordId,
    /// Entity fields as stored and exchanged with the remote API.
    pub payload: Value,
    /// Last local modification time.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a record with a fresh temporary id.
    pub fn new_local(payload: Value) -> Self {
        Self {
            id: RecordId::temporary(),
            payload,
            updated_at: Utc::now(),
        }
    }

    /// Create a record materialized from the remote API.
    pub fn from_remote(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: RecordId::permanent(id),
            payload,
            updated_at: Utc::now(),
        }
    }
}
