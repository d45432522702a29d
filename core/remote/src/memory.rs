//! In-memory remote API for testing and development.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use satchel_common::{CollectionName, Error, Result};

use crate::api::{RemoteApi, RemoteRecord};

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<CollectionName, BTreeMap<String, Value>>,
}

/// In-memory stand-in for the remote service.
///
/// Useful for tests and development: records live in process, permanent ids
/// are sequential, and reachability/failure behavior can be scripted.
pub struct MemoryRemote {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    reject_writes: AtomicBool,
    fail_requests: AtomicU32,
    requests: AtomicU32,
}

impl MemoryRemote {
    /// Create an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            reject_writes: AtomicBool::new(false),
            fail_requests: AtomicU32::new(0),
            requests: AtomicU32::new(0),
        }
    }

    /// Toggle simulated reachability; unreachable requests fail transiently.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make writes fail permanently (validation-style 422), reads untouched.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Fail the next `n` requests with a transient error.
    pub fn fail_requests(&self, n: u32) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Total requests observed (including failed ones).
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Seed a resource directly, returning its permanent id.
    pub fn seed(&self, collection: &CollectionName, payload: Value) -> String {
        let id = self.mint_id();
        let mut inner = self.inner.write().unwrap();
        inner
            .data
            .entry(collection.clone())
            .or_default()
            .insert(id.clone(), payload);
        id
    }

    /// Snapshot a collection as the server holds it (test introspection).
    pub fn snapshot(&self, collection: &CollectionName) -> Vec<RemoteRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .data
            .get(collection)
            .map(|m| {
                m.iter()
                    .map(|(id, payload)| RemoteRecord {
                        id: id.clone(),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mint_id(&self) -> String {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn gate(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network("Remote unreachable".to_string()));
        }
        if self
            .fail_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Network("Injected transient failure".to_string()));
        }
        Ok(())
    }

    fn gate_write(&self) -> Result<()> {
        self.gate()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Api {
                status: 422,
                message: "Payload rejected".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.gate()
    }

    async fn fetch_all(&self, collection: &CollectionName) -> Result<Vec<RemoteRecord>> {
        self.gate()?;
        Ok(self.snapshot(collection))
    }

    async fn fetch(&self, collection: &CollectionName, id: &str) -> Result<RemoteRecord> {
        self.gate()?;
        let inner = self.inner.read().unwrap();
        inner
            .data
            .get(collection)
            .and_then(|m| m.get(id))
            .map(|payload| RemoteRecord {
                id: id.to_string(),
                payload: payload.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("No resource {} in {}", id, collection)))
    }

    async fn create(&self, collection: &CollectionName, payload: &Value) -> Result<RemoteRecord> {
        self.gate_write()?;
        let id = self.mint_id();
        let mut inner = self.inner.write().unwrap();
        inner
            .data
            .entry(collection.clone())
            .or_default()
            .insert(id.clone(), payload.clone());
        Ok(RemoteRecord {
            id,
            payload: payload.clone(),
        })
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord> {
        self.gate_write()?;
        let mut inner = self.inner.write().unwrap();
        let map = inner
            .data
            .get_mut(collection)
            .ok_or_else(|| Error::NotFound(format!("No collection {}", collection)))?;
        if !map.contains_key(id) {
            return Err(Error::NotFound(format!("No resource {} in {}", id, collection)));
        }
        map.insert(id.to_string(), payload.clone());
        Ok(RemoteRecord {
            id: id.to_string(),
            payload: payload.clone(),
        })
    }

    async fn delete(&self, collection: &CollectionName, id: &str) -> Result<()> {
        self.gate_write()?;
        let mut inner = self.inner.write().unwrap();
        let removed = inner
            .data
            .get_mut(collection)
            .and_then(|m| m.remove(id))
            .is_some();
        if removed {
            Ok(())
        } else {
            Err(Error::NotFound(format!("No resource {} in {}", id, collection)))
        }
    }
}
