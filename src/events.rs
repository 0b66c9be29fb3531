//! Notification fan-out shared by the REST session and stream connections.
//!
//! A [`Dispatcher`] keeps listeners per [`NotificationKind`] and invokes them
//! synchronously, in registration order, from whichever task publishes. The
//! listener list is snapshotted before delivery, so listeners may register or
//! remove listeners (including themselves) while being called.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::stream::client::{EventStream, StreamError};
use crate::stream::sse::RawEvent;

/// Notification category, the key listeners register under.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NotificationKind {
    Connected,
    RawData,
    Message,
    Disconnected,
    ClientError,
    Error,
}

impl NotificationKind {
    /// Every category, in lifecycle order.
    pub const ALL: [NotificationKind; 6] = [
        NotificationKind::Connected,
        NotificationKind::RawData,
        NotificationKind::Message,
        NotificationKind::Disconnected,
        NotificationKind::ClientError,
        NotificationKind::Error,
    ];

    /// Stable category name used by other Flowdock clients.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::RawData => "rawdata",
            Self::Message => "message",
            Self::Disconnected => "disconnected",
            Self::ClientError => "clientError",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published notification and its payload.
#[derive(Clone, Debug)]
pub enum Notification {
    /// The stream handshake completed; carries the opened connection.
    Connected(EventStream),
    /// An undecoded push event, published before it is parsed.
    RawData(RawEvent),
    /// A decoded push event payload.
    Message(Value),
    /// The stream transport was lost or ended.
    Disconnected(StreamError),
    /// The decode loop failed for a reason other than transport loss.
    ClientError(StreamError),
    /// A request failed, or a stream handshake exhausted its retries.
    Error(Error),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Connected(_) => NotificationKind::Connected,
            Self::RawData(_) => NotificationKind::RawData,
            Self::Message(_) => NotificationKind::Message,
            Self::Disconnected(_) => NotificationKind::Disconnected,
            Self::ClientError(_) => NotificationKind::ClientError,
            Self::Error(_) => NotificationKind::Error,
        }
    }
}

/// Handle returned by [`Dispatcher::on`], used to remove the listener.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;
type Registry = RwLock<HashMap<NotificationKind, Vec<(ListenerId, Listener)>>>;

/// Publish/subscribe registry keyed by notification kind.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for every notification of `kind`.
    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        remove_listeners(&self.listeners, &[id])
    }

    /// Forwards every notification, of any kind, into an unbounded channel.
    ///
    /// The forwarding listener stays registered until the receiver is dropped
    /// and the next publish notices the closed channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::downgrade(&self.listeners);
        let ids: Arc<RwLock<Vec<ListenerId>>> = Arc::default();
        let forward: Listener = {
            let ids = Arc::clone(&ids);
            Arc::new(move |notification: &Notification| {
                if tx.send(notification.clone()).is_ok() {
                    return;
                }
                if let Some(listeners) = registry.upgrade() {
                    let ids = ids.read().unwrap_or_else(PoisonError::into_inner);
                    remove_listeners(&listeners, &ids);
                }
            })
        };

        let registered: Vec<ListenerId> = NotificationKind::ALL
            .iter()
            .map(|kind| self.register(*kind, Arc::clone(&forward)))
            .collect();
        *ids.write().unwrap_or_else(PoisonError::into_inner) = registered;
        rx
    }

    /// Delivers `notification` to the listeners registered for its kind.
    ///
    /// Returns the number of listeners invoked.
    pub fn publish(&self, notification: &Notification) -> usize {
        let snapshot: Vec<Listener> = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .get(&notification.kind())
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in &snapshot {
            listener(notification);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, kind: NotificationKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    fn register(&self, kind: NotificationKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }
}

fn remove_listeners(registry: &Registry, ids: &[ListenerId]) -> bool {
    let mut listeners = registry.write().unwrap_or_else(PoisonError::into_inner);
    let mut removed = false;
    for entries in listeners.values_mut() {
        let before = entries.len();
        entries.retain(|(entry_id, _)| !ids.contains(entry_id));
        removed |= entries.len() != before;
    }
    removed
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for kind in NotificationKind::ALL {
            if let Some(entries) = listeners.get(&kind) {
                map.entry(&kind.as_str(), &entries.len());
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{Dispatcher, Notification, NotificationKind};

    #[test]
    fn listeners_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            dispatcher.on(NotificationKind::Message, move |_| {
                calls.lock().expect("calls lock").push(label);
            });
        }

        let invoked = dispatcher.publish(&Notification::Message(json!({"id": 1})));
        assert_eq!(invoked, 3);
        assert_eq!(
            *calls.lock().expect("calls lock"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn publish_only_reaches_matching_kind() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(0));
        {
            let seen = Arc::clone(&seen);
            dispatcher.on(NotificationKind::RawData, move |_| {
                *seen.lock().expect("seen lock") += 1;
            });
        }

        assert_eq!(dispatcher.publish(&Notification::Message(json!(null))), 0);
        assert_eq!(*seen.lock().expect("seen lock"), 0);
    }

    #[test]
    fn off_removes_listener() {
        let dispatcher = Dispatcher::new();
        let id = dispatcher.on(NotificationKind::Message, |_| {});
        assert_eq!(dispatcher.listener_count(NotificationKind::Message), 1);

        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(dispatcher.listener_count(NotificationKind::Message), 0);
    }

    #[test]
    fn listener_may_register_during_publish() {
        let dispatcher = Dispatcher::new();
        {
            let inner = dispatcher.clone();
            dispatcher.on(NotificationKind::Message, move |_| {
                inner.on(NotificationKind::Message, |_| {});
            });
        }

        assert_eq!(dispatcher.publish(&Notification::Message(json!(1))), 1);
        assert_eq!(dispatcher.listener_count(NotificationKind::Message), 2);
    }

    #[test]
    fn subscribe_forwards_all_kinds_and_detaches_when_dropped() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher.publish(&Notification::Message(json!({"id": 7})));
        match rx.try_recv().expect("forwarded notification") {
            Notification::Message(value) => assert_eq!(value, json!({"id": 7})),
            other => panic!("unexpected notification: {other:?}"),
        }

        drop(rx);
        dispatcher.publish(&Notification::Message(json!(null)));
        for kind in NotificationKind::ALL {
            assert_eq!(dispatcher.listener_count(kind), 0, "{kind} still registered");
        }
    }

    #[test]
    fn kind_names_match_wire_categories() {
        let names: Vec<&str> = NotificationKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "connected",
                "rawdata",
                "message",
                "disconnected",
                "clientError",
                "error"
            ]
        );
    }
}
