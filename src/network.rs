//! Connectivity observer.
//!
//! Holds the current online/offline state, fed by platform transition events.
//! There is no debounce and no confirmation against the remote service: a
//! reported "online" only means the platform believes it has a network.

use tokio::sync::watch;
use tracing::info;

pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// `initially_online` is the connectivity the platform reports at startup.
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Apply a transition. Returns `true` when the state actually changed;
    /// subscribers are only woken on a change.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "network status changed");
        }
        changed
    }

    /// Platform `online` event.
    pub fn on_online(&self) -> bool {
        self.set_online(true)
    }

    /// Platform `offline` event.
    pub fn on_offline(&self) -> bool {
        self.set_online(false)
    }

    pub fn subscribe(&self) -> NetworkSubscription {
        NetworkSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle receiving connectivity changes. Dropping it, or calling
/// [`NetworkSubscription::unsubscribe`], releases it.
pub struct NetworkSubscription {
    rx: watch::Receiver<bool>,
}

impl NetworkSubscription {
    pub fn current(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next change and return the new state. Rapid flips may
    /// be coalesced; the latest state is always delivered. `None` once the
    /// monitor is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Resolve as soon as the device is online. `false` if the monitor was
    /// dropped first.
    pub async fn wait_until_online(&mut self) -> bool {
        self.rx.wait_for(|online| *online).await.is_ok()
    }

    pub fn unsubscribe(self) {}
}
