//! In-process tree store.
//!
//! Holds the whole tree as a single JSON value. Besides serving embedders and
//! tests, it can simulate an unreachable backend and per-path permission
//! failures.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::hub::ChangeHub;
use super::{
    set_value_at, value_at, ChildEvent, PushIdGenerator, StoreError, StoreResult, TreePath,
    TreeStore, ValueChange,
};

/// A tree store that lives entirely in memory.
#[derive(Debug)]
pub struct MemoryTreeStore {
    tree: Mutex<Value>,
    hub: ChangeHub,
    push_ids: PushIdGenerator,
    reachable: AtomicBool,
    denied: Mutex<Vec<TreePath>>,
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTreeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tree(Value::Null)
    }

    /// Create a store holding `tree`.
    #[must_use]
    pub fn with_tree(tree: Value) -> Self {
        Self {
            tree: Mutex::new(tree),
            hub: ChangeHub::new(),
            push_ids: PushIdGenerator::new(),
            reachable: AtomicBool::new(true),
            denied: Mutex::new(Vec::new()),
        }
    }

    /// Simulate losing or regaining the connection.
    ///
    /// Going offline delivers an error to every value listener. Coming back
    /// re-delivers the current value to every listener.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        if was == reachable {
            return;
        }

        if reachable {
            debug!("Memory store reachable again");
            self.hub.republish_all(|p| Ok(self.read(p)));
        } else {
            debug!("Memory store unreachable");
            self.hub.publish_error(&Self::offline());
        }
    }

    /// Reject writes at `path` and below with a permission error.
    pub fn deny_writes(&self, path: &TreePath) {
        self.denied.lock().push(path.clone());
    }

    /// Lift all write denials.
    pub fn allow_all_writes(&self) {
        self.denied.lock().clear();
    }

    /// Copy of the whole tree.
    #[must_use]
    pub fn dump(&self) -> Value {
        self.tree.lock().clone()
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    fn offline() -> StoreError {
        StoreError::Unavailable("memory store is offline".to_string())
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Self::offline())
        }
    }

    fn check_writable(&self, path: &TreePath) -> StoreResult<()> {
        self.check_reachable()?;
        if self.denied.lock().iter().any(|d| d.contains(path)) {
            return Err(StoreError::PermissionDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn read(&self, path: &TreePath) -> Option<Value> {
        value_at(&self.tree.lock(), path).cloned()
    }

    fn write(&self, path: &TreePath, value: Value) {
        {
            let mut tree = self.tree.lock();
            set_value_at(&mut tree, path, value);
        }
        self.hub.publish(path, |p| Ok(self.read(p)));
    }
}

#[async_trait::async_trait]
impl TreeStore for MemoryTreeStore {
    async fn get(&self, path: &TreePath) -> StoreResult<Option<Value>> {
        self.check_reachable()?;
        Ok(self.read(path))
    }

    async fn set(&self, path: &TreePath, value: Value) -> StoreResult<()> {
        self.check_writable(path)?;
        self.write(path, value);
        Ok(())
    }

    async fn update(&self, path: &TreePath, fields: Map<String, Value>) -> StoreResult<()> {
        self.check_writable(path)?;
        let children = fields
            .into_iter()
            .map(|(key, value)| path.child(&key).map(|child| (child, value)))
            .collect::<StoreResult<Vec<_>>>()?;

        {
            let mut tree = self.tree.lock();
            for (child, value) in children {
                set_value_at(&mut tree, &child, value);
            }
        }
        self.hub.publish(path, |p| Ok(self.read(p)));
        Ok(())
    }

    async fn remove(&self, path: &TreePath) -> StoreResult<()> {
        self.check_writable(path)?;
        self.write(path, Value::Null);
        Ok(())
    }

    async fn push(&self, path: &TreePath, value: Value) -> StoreResult<String> {
        self.check_writable(path)?;
        let id = self.push_ids.next_id();
        let child = path.child(&id)?;
        self.write(&child, value);
        Ok(id)
    }

    async fn watch_value(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ValueChange>> {
        Ok(self.hub.watch_value(path))
    }

    async fn watch_children(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ChildEvent>> {
        Ok(self.hub.watch_children(path, |p| Ok(self.read(p))))
    }
}
