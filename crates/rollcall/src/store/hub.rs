//! Listener fan-out shared by the tree store backends.
//!
//! Backends call [`ChangeHub::publish`] after every mutation. The hub works
//! out which listeners the change can affect, re-reads their paths through
//! the supplied reader, and broadcasts the result.
//!
//! Lock order is hub first, then backend. Backends must release their own
//! lock before publishing.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::{child_keys, ChildEvent, StoreError, StoreResult, TreePath, ValueChange};

/// Capacity of each listener channel.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
struct ValueWatch {
    path: TreePath,
    sender: broadcast::Sender<ValueChange>,
}

#[derive(Debug)]
struct ChildWatch {
    path: TreePath,
    sender: broadcast::Sender<ChildEvent>,
    known: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct HubState {
    values: Vec<ValueWatch>,
    children: Vec<ChildWatch>,
}

impl HubState {
    fn prune(&mut self) {
        self.values.retain(|w| w.sender.receiver_count() > 0);
        self.children.retain(|w| w.sender.receiver_count() > 0);
    }
}

/// Registry of value and child listeners.
#[derive(Debug, Default)]
pub struct ChangeHub {
    state: Mutex<HubState>,
}

impl ChangeHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value listener.
    pub fn watch_value(&self, path: &TreePath) -> broadcast::Receiver<ValueChange> {
        let mut state = self.state.lock();
        state.prune();

        if let Some(existing) = state.values.iter().find(|w| &w.path == path) {
            return existing.sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        state.values.push(ValueWatch {
            path: path.clone(),
            sender,
        });
        receiver
    }

    /// Register a child listener.
    ///
    /// `read` supplies the current value at `path`; its children become the
    /// baseline that later events are diffed against. A failed read leaves
    /// the baseline empty.
    pub fn watch_children<F>(&self, path: &TreePath, read: F) -> broadcast::Receiver<ChildEvent>
    where
        F: Fn(&TreePath) -> StoreResult<Option<Value>>,
    {
        let mut state = self.state.lock();
        state.prune();

        if let Some(existing) = state.children.iter().find(|w| &w.path == path) {
            return existing.sender.subscribe();
        }

        let known = read(path)
            .map(|value| child_keys(value.as_ref()))
            .unwrap_or_default();
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        state.children.push(ChildWatch {
            path: path.clone(),
            sender,
            known,
        });
        receiver
    }

    /// Notify every listener related to `changed`.
    pub fn publish<F>(&self, changed: &TreePath, read: F)
    where
        F: Fn(&TreePath) -> StoreResult<Option<Value>>,
    {
        let mut state = self.state.lock();
        state.prune();

        for watch in state.values.iter().filter(|w| w.path.is_related(changed)) {
            trace!("Notifying value listener at {} of change at {}", watch.path, changed);
            // A send error only means every receiver has gone away.
            let _ = watch.sender.send(read(&watch.path));
        }

        for watch in state
            .children
            .iter_mut()
            .filter(|w| w.path.is_related(changed))
        {
            let Ok(value) = read(&watch.path) else {
                continue;
            };
            let current = child_keys(value.as_ref());
            for added in current.difference(&watch.known) {
                let _ = watch.sender.send(ChildEvent::Added(added.clone()));
            }
            for removed in watch.known.difference(&current) {
                let _ = watch.sender.send(ChildEvent::Removed(removed.clone()));
            }
            watch.known = current;
        }
    }

    /// Deliver an error to every value listener.
    pub fn publish_error(&self, error: &StoreError) {
        let mut state = self.state.lock();
        state.prune();
        for watch in &state.values {
            let _ = watch.sender.send(Err(error.clone()));
        }
    }

    /// Re-read and deliver every listened path, as after a reconnect.
    pub fn republish_all<F>(&self, read: F)
    where
        F: Fn(&TreePath) -> StoreResult<Option<Value>>,
    {
        self.publish(&TreePath::root(), read);
    }

    /// Number of live listeners, value and child combined.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.values.len() + state.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> TreePath {
        TreePath::parse(p).unwrap()
    }

    #[test]
    fn test_publish_reaches_related_value_listeners() {
        let hub = ChangeHub::new();
        let mut parent = hub.watch_value(&path("children"));
        let mut child = hub.watch_value(&path("children/tom/eta"));
        let mut other = hub.watch_value(&path("drivers"));

        hub.publish(&path("children/tom"), |p| Ok(Some(json!(p.as_key()))));

        assert_eq!(parent.try_recv().unwrap(), Ok(Some(json!("children"))));
        assert_eq!(
            child.try_recv().unwrap(),
            Ok(Some(json!("children/tom/eta")))
        );
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_child_events_are_diffed() {
        let hub = ChangeHub::new();
        let mut events = hub.watch_children(&path("children"), |_| Ok(Some(json!({"tom": {}}))));

        hub.publish(&path("children/ann"), |_| {
            Ok(Some(json!({"tom": {}, "ann": {}})))
        });
        assert_eq!(events.try_recv().unwrap(), ChildEvent::Added("ann".to_string()));
        assert!(events.try_recv().is_err());

        hub.publish(&path("children/tom"), |_| Ok(Some(json!({"ann": {}}))));
        assert_eq!(
            events.try_recv().unwrap(),
            ChildEvent::Removed("tom".to_string())
        );
    }

    #[test]
    fn test_child_listener_ignores_field_changes() {
        let hub = ChangeHub::new();
        let mut events = hub.watch_children(&path("children"), |_| Ok(Some(json!({"tom": {}}))));

        hub.publish(&path("children/tom/eta"), |_| {
            Ok(Some(json!({"tom": {"eta": "now"}})))
        });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_publish_error() {
        let hub = ChangeHub::new();
        let mut rx = hub.watch_value(&path("children"));
        hub.publish_error(&StoreError::Unavailable("offline".to_string()));
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let hub = ChangeHub::new();
        let rx = hub.watch_value(&path("children"));
        let _events = hub.watch_children(&path("children"), |_| Ok(None));
        assert_eq!(hub.listener_count(), 2);

        drop(rx);
        assert_eq!(hub.listener_count(), 1);
    }

    #[test]
    fn test_same_path_shares_channel() {
        let hub = ChangeHub::new();
        let mut a = hub.watch_value(&path("children"));
        let mut b = hub.watch_value(&path("children"));
        assert_eq!(hub.listener_count(), 1);

        hub.publish(&path("children"), |_| Ok(None));
        assert_eq!(a.try_recv().unwrap(), Ok(None));
        assert_eq!(b.try_recv().unwrap(), Ok(None));
    }
}
