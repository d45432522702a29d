//! Collection configuration.
//!
//! The set of collections is fixed when the engine is constructed; every
//! operation on a name outside this set is a configuration error, raised
//! synchronously and never deferred into the outbox.

use serde::{Deserialize, Serialize};

use crate::{CollectionName, Error, Result};

/// One configured collection and its remote resource path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name as used by application code.
    pub name: CollectionName,
    /// Resource path on the remote API, relative to the base URL
    /// (e.g. "api/products").
    pub remote_path: String,
}

impl CollectionSpec {
    /// Create a spec for a collection.
    pub fn new(name: CollectionName, remote_path: impl Into<String>) -> Self {
        Self {
            name,
            remote_path: remote_path.into(),
        }
    }
}

/// The static `collection -> remote resource path` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collections {
    specs: Vec<CollectionSpec>,
}

impl Collections {
    /// Build the collection set.
    ///
    /// # Errors
    /// - Returns error if the set is empty or contains duplicate names
    pub fn new(specs: Vec<CollectionSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::InvalidInput(
                "At least one collection must be configured".to_string(),
            ));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate collection: {}",
                    spec.name
                )));
            }
        }
        Ok(Self { specs })
    }

    /// All configured collection names.
    pub fn names(&self) -> Vec<CollectionName> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Whether a collection is configured.
    pub fn contains(&self, name: &CollectionName) -> bool {
        self.specs.iter().any(|s| &s.name == name)
    }

    /// Resolve the remote resource path for a collection.
    ///
    /// # Errors
    /// - `Error::UnknownCollection` for unconfigured names
    pub fn remote_path(&self, name: &CollectionName) -> Result<&str> {
        self.specs
            .iter()
            .find(|s| &s.name == name)
            .map(|s| s.remote_path.as_str())
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Fail unless the collection is configured.
    pub fn check(&self, name: &CollectionName) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(Error::UnknownCollection(name.to_string()))
        }
    }

    /// Iterate over the configured specs.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.specs.iter()
    }
}
