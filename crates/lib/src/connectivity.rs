//! Process-wide online/offline signal with listener registration.
//!
//! Listeners are called on every transition (not on repeated sets of the same state).
//! An optional probe task drives the signal from backend reachability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Online/offline signal shared by the reconciler, the outbox and any other subscriber.
pub struct Connectivity {
    online: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

/// Registration handle returned by [`Connectivity::on_online_change`].
pub struct Subscription {
    id: u64,
    owner: Weak<Connectivity>,
}

impl Subscription {
    /// Remove the listener. Dropping the handle without calling this keeps the listener registered.
    pub fn unsubscribe(self) {
        if let Some(owner) = self.owner.upgrade() {
            if let Ok(mut g) = owner.listeners.lock() {
                g.remove(&self.id);
            }
        }
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register a listener for transitions; `listener(true)` on going online, `listener(false)` on going offline.
    pub fn on_online_change(
        self: &Arc<Self>,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut g) = self.listeners.lock() {
            g.insert(id, Arc::new(listener));
        }
        Subscription {
            id,
            owner: Arc::downgrade(self),
        }
    }

    /// Set the current state; listeners run only when it changes.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        if online {
            log::info!("net: online");
        } else {
            log::warn!("net: offline");
        }
        // Snapshot so listeners may (un)subscribe without deadlocking.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(g) => g.values().cloned().collect(),
            Err(_) => return,
        };
        for l in listeners {
            l(online);
        }
    }

    /// Periodically ping the API base and update the signal until `cancel` fires.
    pub fn spawn_probe(
        self: &Arc<Self>,
        api: ApiClient,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let reachable = api.ping().await;
                this.set_online(reachable);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            log::debug!("net: probe stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_on_transitions_only() {
        let net = Connectivity::new(true);
        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        let (u, d) = (ups.clone(), downs.clone());
        let _sub = net.on_online_change(move |online| {
            if online {
                u.fetch_add(1, Ordering::SeqCst);
            } else {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        net.set_online(true);
        net.set_online(false);
        net.set_online(false);
        net.set_online(true);
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert!(net.is_online());
    }

    #[test]
    fn unsubscribe_stops_notifications_for_that_listener_only() {
        let net = Connectivity::new(false);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        let sub_a = net.on_online_change(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_b = net.on_online_change(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });
        net.set_online(true);
        sub_a.unsubscribe();
        net.set_online(false);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }
}
