//! Routing of provider callbacks back to their watcher.
//!
//! The provider only ever sees a [`Notifier`], which is an integer key into a
//! process-wide route table. The watcher object itself never crosses the
//! provider boundary, and a key whose watcher has gone away simply fails to
//! route.

use super::Notification;
use crate::types::RecordHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Receives notifications routed through the table.
pub trait NotificationSink: Send + Sync {
    /// Handle one notification for the subscription on `channel`. Runs on the
    /// provider's thread.
    fn notify(&self, channel: &str, notification: Notification);
}

struct Route {
    sink: Weak<dyn NotificationSink>,
    channel: Arc<str>,
}

struct RouteTable {
    routes: RwLock<HashMap<u64, Route>>,
    next_key: AtomicU64,
}

fn table() -> &'static RouteTable {
    static TABLE: OnceLock<RouteTable> = OnceLock::new();
    TABLE.get_or_init(|| RouteTable {
        routes: RwLock::new(HashMap::new()),
        next_key: AtomicU64::new(1),
    })
}

/// Callback key handed to `Provider::subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Notifier {
    key: u64,
}

impl Notifier {
    /// Register a route for `channel` and return its key.
    pub fn register(sink: Weak<dyn NotificationSink>, channel: &str) -> Self {
        let table = table();
        let key = table.next_key.fetch_add(1, Ordering::Relaxed);
        table.routes.write().insert(
            key,
            Route {
                sink,
                channel: Arc::from(channel),
            },
        );
        Notifier { key }
    }

    /// Remove the route. Later notifications through this key are dropped.
    pub fn unregister(self) {
        table().routes.write().remove(&self.key);
    }

    pub fn key(self) -> u64 {
        self.key
    }

    /// Whether the route still exists.
    pub fn is_registered(self) -> bool {
        table().routes.read().contains_key(&self.key)
    }

    /// Deliver a record notification.
    pub fn deliver(self, record: RecordHandle) -> bool {
        self.notify(Notification::Deliver(record))
    }

    /// Report a subscription failure.
    pub fn error(self, message: impl Into<String>) -> bool {
        self.notify(Notification::Error(message.into()))
    }

    /// Route a notification to its sink. Returns false if the key is unknown
    /// or its watcher is gone.
    pub fn notify(self, notification: Notification) -> bool {
        let target = {
            let routes = table().routes.read();
            routes
                .get(&self.key)
                .and_then(|route| Some((route.sink.upgrade()?, Arc::clone(&route.channel))))
        };

        match target {
            Some((sink, channel)) => {
                sink.notify(&channel, notification);
                true
            }
            None => {
                tracing::debug!(key = self.key, "dropping notification for unrouted callback key");
                false
            }
        }
    }
}
