//! The child key registry.
//!
//! A [`ChildKeyRegistry`] is one dashboard session against the tree store.
//! Opening it makes sure a record exists for every display name handed in,
//! then attaches two standing listeners on the record collection:
//!
//! - membership, which keeps the set of live keys current
//! - reconciliation, which renames records whose key no longer matches
//!   their display name
//!
//! Per-field streams are opened on demand with
//! [`ChildKeyRegistry::observe_field`]. Every listener belongs to the
//! registry's task group and is released by [`ChildKeyRegistry::close`] or
//! when the registry is dropped.

mod fields;
mod membership;
mod reconcile;
pub mod tasks;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::key::{dedupe_names, ChildKey};
use crate::objects::ObjectStore;
use crate::record::{ChildField, ChildRecord, ChildStatus, Message, RecordDefaults, MESSAGES_FIELD};
use crate::store::{TreePath, TreeStore};

pub use fields::{FieldStream, FieldValue};
pub use reconcile::RenameOutcome;
pub use tasks::{ShutdownSignal, TaskGroup};

/// Default wait between copying a renamed record and deleting the old key.
pub const DEFAULT_SETTLING_DELAY: Duration = Duration::from_millis(1000);

/// Settings for a registry session.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Path of the record collection.
    pub root: TreePath,
    /// Values written into new records.
    pub defaults: RecordDefaults,
    /// Wait between a rename's copy and its delete.
    pub settling_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: TreePath::parse("children").unwrap_or_default(),
            defaults: RecordDefaults::default(),
            settling_delay: DEFAULT_SETTLING_DELAY,
        }
    }
}

/// What [`ChildKeyRegistry::ensure_record`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The record did not exist and was written in full.
    Created,
    /// The record existed; these missing fields were filled in.
    Filled(Vec<String>),
    /// The record existed and was complete.
    Unchanged,
}

/// State shared between the registry handle and its tasks.
#[derive(Debug)]
pub(crate) struct Inner {
    store: Arc<dyn TreeStore>,
    objects: Arc<dyn ObjectStore>,
    settings: RegistrySettings,
    tasks: TaskGroup,
    live_keys: watch::Sender<BTreeSet<ChildKey>>,
    display_names: Mutex<HashMap<ChildKey, String>>,
    photo_urls: Mutex<HashMap<ChildKey, String>>,
    /// Key currently followed by each open field stream.
    bindings: Mutex<HashMap<u64, watch::Sender<ChildKey>>>,
    next_binding: AtomicU64,
    /// Old keys with a rename in progress, mapped to the new key once the
    /// record has been copied there.
    renames: watch::Sender<HashMap<ChildKey, Option<ChildKey>>>,
    /// Old keys whose delete failed. They are not renamed again this session.
    orphaned: Mutex<HashSet<ChildKey>>,
}

impl Inner {
    fn record_path(&self, key: &ChildKey) -> Result<TreePath> {
        Ok(self.settings.root.child(key.as_str())?)
    }

    fn field_path(&self, key: &ChildKey, field: &str) -> Result<TreePath> {
        Ok(self.record_path(key)?.child(field)?)
    }

    /// The key a new stream on `key` should follow: the target of a rename
    /// already copied away from `key`, or `key` itself.
    fn follow(&self, key: &ChildKey) -> ChildKey {
        match self.renames.borrow().get(key) {
            Some(Some(new)) => new.clone(),
            _ => key.clone(),
        }
    }

    /// Point every field stream following `old` at `new`, and carry the
    /// cached values across.
    fn rebind(&self, old: &ChildKey, new: &ChildKey) {
        let mut moved = 0;
        for binding in self.bindings.lock().values() {
            if *binding.borrow() == *old {
                binding.send_replace(new.clone());
                moved += 1;
            }
        }

        for cache in [&self.display_names, &self.photo_urls] {
            let mut cache = cache.lock();
            if let Some(value) = cache.remove(old) {
                cache.insert(new.clone(), value);
            }
        }

        debug!("Rebound {moved} field stream(s) from {old} to {new}");
    }
}

/// A live view of the child records in a tree store.
#[derive(Debug)]
pub struct ChildKeyRegistry {
    inner: Arc<Inner>,
}

impl ChildKeyRegistry {
    /// Open a session.
    ///
    /// Records are ensured for `names` in order, skipping names that
    /// normalize to nothing and later spellings of an already seen key. A
    /// failure for one name is logged and does not stop the others. The
    /// membership and reconciliation listeners are attached afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection listeners cannot be attached.
    pub async fn open<S: AsRef<str>>(
        store: Arc<dyn TreeStore>,
        objects: Arc<dyn ObjectStore>,
        settings: RegistrySettings,
        names: &[S],
    ) -> Result<Self> {
        let (live_keys, _) = watch::channel(BTreeSet::new());
        let (renames, _) = watch::channel(HashMap::new());
        let inner = Arc::new(Inner {
            store,
            objects,
            settings,
            tasks: TaskGroup::new(),
            live_keys,
            display_names: Mutex::new(HashMap::new()),
            photo_urls: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(0),
            renames,
            orphaned: Mutex::new(HashSet::new()),
        });
        let registry = Self { inner };

        for name in dedupe_names(names) {
            let Some(key) = ChildKey::from_display_name(&name) else {
                continue;
            };
            // Failures are already logged by ensure_record.
            let _ = registry.ensure_record(&key, &name).await;
        }

        membership::start(&registry.inner).await?;
        reconcile::start(&registry.inner).await?;

        info!(
            "Opened registry on {} with {} live key(s)",
            registry.inner.settings.root,
            registry.inner.live_keys.borrow().len()
        );
        Ok(registry)
    }

    /// The registry's settings.
    #[must_use]
    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Keys currently present in the store, sorted.
    #[must_use]
    pub fn live_keys(&self) -> Vec<ChildKey> {
        self.inner.live_keys.borrow().iter().cloned().collect()
    }

    /// Follow the live key set.
    ///
    /// The receiver starts out marked as changed, so the first
    /// `changed().await` returns straight away with the current set.
    #[must_use]
    pub fn observe_keys(&self) -> watch::Receiver<BTreeSet<ChildKey>> {
        let mut rx = self.inner.live_keys.subscribe();
        rx.mark_changed();
        rx
    }

    /// Make sure a record exists at `key`.
    ///
    /// A missing record is written in full. An existing record only gets
    /// the fields it lacks entirely; its ETA is never touched. A value that
    /// is not an object is replaced as if the record were missing.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read or the write fails. Nothing is
    /// retried.
    pub async fn ensure_record(&self, key: &ChildKey, display_name: &str) -> Result<EnsureOutcome> {
        let inner = &self.inner;
        let path = inner.record_path(key)?;

        let existing = inner.store.get(&path).await.map_err(|e| {
            warn!("Failed to read record {key}: {e}");
            e
        })?;

        let outcome = match existing {
            Some(Value::Object(object)) => {
                let missing = inner.settings.defaults.missing_fields(&object, display_name);
                if missing.is_empty() {
                    EnsureOutcome::Unchanged
                } else {
                    let names: Vec<String> = missing.keys().cloned().collect();
                    inner.store.update(&path, missing).await.map_err(|e| {
                        warn!("Failed to fill record {key}: {e}");
                        e
                    })?;
                    EnsureOutcome::Filled(names)
                }
            }
            _ => {
                let record = inner.settings.defaults.new_record(display_name);
                inner.store.set(&path, record).await.map_err(|e| {
                    warn!("Failed to create record {key}: {e}");
                    e
                })?;
                EnsureOutcome::Created
            }
        };

        match &outcome {
            EnsureOutcome::Created => info!("Created record {key} for '{display_name}'"),
            EnsureOutcome::Filled(fields) => info!("Filled {} on record {key}", fields.join(", ")),
            EnsureOutcome::Unchanged => debug!("Record {key} already complete"),
        }
        Ok(outcome)
    }

    /// Write a child's status. Last write wins.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn update_status(&self, key: &ChildKey, status: &ChildStatus) -> Result<()> {
        let path = self.inner.field_path(key, ChildField::Status.as_str())?;
        self.inner
            .store
            .set(&path, json!(status.as_str()))
            .await
            .map_err(|e| {
                warn!("Failed to update status of {key}: {e}");
                e
            })?;
        debug!("Set status of {key} to {status}");
        Ok(())
    }

    /// Append a message to a child's log.
    ///
    /// Returns the store-generated id of the new entry.
    ///
    /// # Errors
    ///
    /// Returns the store error if the push fails.
    pub async fn push_message(&self, key: &ChildKey, action: &str, text: &str) -> Result<String> {
        let path = self.inner.field_path(key, MESSAGES_FIELD)?;
        let message = serde_json::to_value(Message::new(action, text))?;
        let id = self.inner.store.push(&path, message).await.map_err(|e| {
            warn!("Failed to push message to {key}: {e}");
            e
        })?;
        debug!("Pushed message {id} to {key}");
        Ok(id)
    }

    /// Read every record in the collection, sorted by key.
    ///
    /// Entries that are not objects are skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn snapshot(&self) -> Result<Vec<ChildRecord>> {
        let value = self.inner.store.get(&self.inner.settings.root).await?;
        let mut records: Vec<ChildRecord> = value
            .as_ref()
            .and_then(Value::as_object)
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(key, value)| {
                        ChildRecord::from_value(ChildKey::from_stored(key.as_str())?, value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Open a live stream of one field of one record.
    ///
    /// The first value is available immediately. See [`FieldStream`].
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot form a store path.
    pub async fn observe_field(&self, key: &ChildKey, field: ChildField) -> Result<FieldStream> {
        fields::open(&self.inner, key, field).await
    }

    /// Resolve a display name to a live key.
    ///
    /// Tries the normalized name as a key first, then a case-insensitive
    /// match against display names seen by open streams. Returns `None`
    /// when neither matches.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ChildKey> {
        let live = self.inner.live_keys.borrow();

        let candidate = ChildKey::from_display_name(name)?;
        if live.contains(&candidate) {
            return Some(candidate);
        }

        let wanted = name.trim().to_lowercase();
        self.inner
            .display_names
            .lock()
            .iter()
            .filter(|(key, cached)| live.contains(*key) && cached.trim().to_lowercase() == wanted)
            .map(|(key, _)| key.clone())
            .min()
    }

    /// Like [`resolve`](Self::resolve), falling back to the first live key.
    #[must_use]
    pub fn resolve_or_first(&self, name: &str) -> Option<ChildKey> {
        self.resolve(name)
            .or_else(|| self.inner.live_keys.borrow().first().cloned())
    }

    /// Last display name seen for `key` by an open stream.
    #[must_use]
    pub fn cached_display_name(&self, key: &ChildKey) -> Option<String> {
        self.inner.display_names.lock().get(key).cloned()
    }

    /// Last photo URL emitted for `key` by an open stream.
    #[must_use]
    pub fn cached_photo_url(&self, key: &ChildKey) -> Option<String> {
        self.inner.photo_urls.lock().get(key).cloned()
    }

    /// Run one reconciliation pass over the current collection and wait for
    /// the renames it starts, settling delays included.
    ///
    /// Returns the number of renames started by this pass.
    ///
    /// # Errors
    ///
    /// Returns the store error if the collection cannot be read.
    pub async fn reconcile_now(&self) -> Result<usize> {
        let value = self.inner.store.get(&self.inner.settings.root).await?;
        let started = reconcile::pass(&self.inner, value.as_ref());
        self.settle().await;
        Ok(started)
    }

    /// Wait until no rename is in progress.
    pub async fn settle(&self) {
        let mut rx = self.inner.renames.subscribe();
        let _ = rx.wait_for(HashMap::is_empty).await;
    }

    /// Number of renames in progress.
    #[must_use]
    pub fn pending_renames(&self) -> usize {
        self.inner.renames.borrow().len()
    }

    /// End the session.
    ///
    /// Signals every listener task to stop and waits for them. A rename
    /// waiting out its settling delay drops its delete. Writes already under
    /// way are not cancelled.
    pub async fn close(self) {
        self.inner.tasks.close().await;
        info!("Closed registry on {}", self.inner.settings.root);
    }
}

impl Drop for ChildKeyRegistry {
    fn drop(&mut self) {
        self.inner.tasks.shutdown();
        self.inner.tasks.abort_all();
    }
}
