//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use satchel_common::{CollectionSpec, Collections, Result};
use satchel_sync::RetryPolicy;

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Configuration for one engine instance.
///
/// Everything the application decides at startup lives here: the collection
/// map, the remote base URL, timeouts and sync cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the remote API.
    pub base_url: String,
    /// Configured collections and their remote resource paths.
    pub collections: Vec<CollectionSpec>,
    /// Bounded timeout applied to every remote request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Cadence of periodic background syncs; `None` disables them.
    #[serde(default)]
    pub auto_sync_interval: Option<Duration>,
    /// Cadence of reachability probes; `None` leaves connectivity to the
    /// application.
    #[serde(default)]
    pub probe_interval: Option<Duration>,
    /// Retry behavior for remote calls and cycle-level backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(base_url: impl Into<String>, collections: Vec<CollectionSpec>) -> Self {
        Self {
            base_url: base_url.into(),
            collections,
            request_timeout: default_request_timeout(),
            auto_sync_interval: None,
            probe_interval: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Validate and build the collection set.
    pub fn collection_set(&self) -> Result<Collections> {
        Collections::new(self.collections.clone())
    }
}
