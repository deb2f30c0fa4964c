//! Connectivity monitor.
//!
//! One process-wide online/offline flag plus a transition counter. The
//! counter increases on every actual change, so a consumer that compares
//! counters sees an offline→online edge even if it only looks after the flag
//! has flipped back and forth.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Snapshot of the connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityStatus {
    /// Whether the remote is believed reachable.
    pub online: bool,
    /// Number of state changes since the monitor was created.
    pub transitions: u64,
}

type Callback = Arc<dyn Fn(ConnectivityStatus) + Send + Sync>;

struct Inner {
    tx: watch::Sender<ConnectivityStatus>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    /// Serializes state changes so transitions and notifications agree.
    change: Mutex<()>,
}

/// Tracks online/offline transitions.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    /// Creates a monitor in the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityStatus {
            online,
            transitions: 0,
        });
        Self {
            inner: Arc::new(Inner {
                tx,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                change: Mutex::new(()),
            }),
        }
    }

    /// Returns whether the remote is believed reachable.
    pub fn is_online(&self) -> bool {
        self.inner.tx.borrow().online
    }

    /// Returns the current status.
    pub fn status(&self) -> ConnectivityStatus {
        *self.inner.tx.borrow()
    }

    /// Records the observed state.
    ///
    /// Returns true if it changed; only then is the transition counter
    /// bumped and subscribers notified.
    pub fn set_online(&self, online: bool) -> bool {
        let status = {
            let _change = self.inner.change.lock();
            let current = *self.inner.tx.borrow();
            if current.online == online {
                return false;
            }
            let next = ConnectivityStatus {
                online,
                transitions: current.transitions + 1,
            };
            self.inner.tx.send_replace(next);
            next
        };

        tracing::info!(online, transitions = status.transitions, "connectivity changed");
        let callbacks: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(status);
        }
        true
    }

    /// Returns a receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<ConnectivityStatus> {
        self.inner.tx.subscribe()
    }

    /// Registers a callback run after every change.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped or unsubscribed.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(ConnectivityStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::new(on_change)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.status())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle of a connectivity callback; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Removes the callback.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Environment-specific reachability check.
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Returns true if the remote currently looks reachable.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// Feeds probe results into `monitor` every `every` until `stop` flips.
pub async fn run_probe<P: ConnectivityProbe>(
    probe: P,
    monitor: ConnectivityMonitor,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let online = probe.probe().await;
                monitor.set_online(online);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("connectivity probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn transitions_only_count_changes() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));

        assert_eq!(
            monitor.status(),
            ConnectivityStatus {
                online: false,
                transitions: 2
            }
        );
    }

    #[test]
    fn subscription_lifecycle() {
        let monitor = ConnectivityMonitor::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = monitor.subscribe(move |status| sink.lock().push(status.online));

        monitor.set_online(false);
        monitor.set_online(true);
        subscription.unsubscribe();
        monitor.set_online(false);

        assert_eq!(*seen.lock(), vec![false, true]);
        assert_eq!(monitor.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn watch_sees_edge_after_flapping() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.watch();
        let seen = rx.borrow_and_update().transitions;

        monitor.set_online(false);
        monitor.set_online(true);

        rx.changed().await.unwrap();
        let status = *rx.borrow_and_update();
        assert!(status.online);
        assert_eq!(status.transitions, seen + 2);
    }

    struct FlagProbe(Arc<AtomicBool>);

    impl ConnectivityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn probe_loop_updates_monitor() {
        let flag = Arc::new(AtomicBool::new(true));
        let monitor = ConnectivityMonitor::new(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_probe(
            FlagProbe(Arc::clone(&flag)),
            monitor.clone(),
            Duration::from_millis(5),
            stop_rx,
        ));

        let mut rx = monitor.watch();
        rx.wait_for(|s| s.online).await.unwrap();

        flag.store(false, Ordering::SeqCst);
        rx.wait_for(|s| !s.online).await.unwrap();

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
