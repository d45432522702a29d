//! Connectivity monitoring - the single source of truth for reachability.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use satchel_remote::RemoteApi;

/// Process-wide online/offline state.
///
/// The monitor is the only writer; everything else reads `is_online` or
/// subscribes for transitions. Steady-state updates are swallowed, so
/// observers wake up on actual changes only and redundant sync triggers
/// cannot happen.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Create a monitor that starts online.
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Current reachability.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record an observed state. Observers are notified on transitions only.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|state| {
            if *state != online {
                *state = online;
                true
            } else {
                false
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Spawn a task that probes the remote at a fixed cadence and feeds the
    /// observations back into this monitor.
    ///
    /// Abort the returned handle to stop probing.
    pub fn spawn_prober(
        &self,
        remote: Arc<dyn RemoteApi>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let online = remote.ping().await.is_ok();
                debug!(online, "Reachability probe");
                monitor.set_online(online);
            }
        })
    }
}
