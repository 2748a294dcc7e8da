//! Network-presence signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared online/offline flag. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender: Arc::new(sender) }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Update the signal. Returns `true` when the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(target: "lifeline::network", online, "network presence changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolve once the signal reports online.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // Err means the sender is gone, which cannot happen while `self` holds it.
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
