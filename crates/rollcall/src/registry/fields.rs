//! Per-field live value streams.
//!
//! Each stream is backed by a task that listens on `<root>/<key>/<field>`
//! and turns whatever the store delivers into a display string. Missing or
//! mistyped values become the field's placeholder and store errors become
//! its sentinel, so a stream never ends because of the data. When the
//! record is renamed the task re-attaches to the new key and emits again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::tasks::ShutdownSignal;
use super::Inner;
use crate::error::Result;
use crate::key::ChildKey;
use crate::objects::ObjectRef;
use crate::record::{ChildField, LOADING};
use crate::store::{StoreResult, TreePath, ValueChange};

/// One emission of a field stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    /// Key the value was read from.
    pub key: ChildKey,
    /// The value, placeholder, or sentinel.
    pub value: String,
}

/// A live stream of one field of one record.
///
/// The stream holds the latest value only: a slow reader skips intermediate
/// values, and identical consecutive values are delivered once. It never
/// ends on its own; [`next`](Self::next) returns `None` only after the
/// registry has been closed or dropped. Dropping the stream releases its
/// store listener.
#[derive(Debug)]
pub struct FieldStream {
    field: ChildField,
    rx: watch::Receiver<Option<FieldValue>>,
}

impl FieldStream {
    /// The observed field.
    #[must_use]
    pub fn field(&self) -> ChildField {
        self.field
    }

    /// The latest value, without waiting.
    #[must_use]
    pub fn current(&self) -> Option<FieldValue> {
        self.rx.borrow().clone()
    }

    /// Wait for the next value.
    ///
    /// The first call returns the value current at subscription straight
    /// away.
    pub async fn next(&mut self) -> Option<FieldValue> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }
}

/// Removes a stream's key binding when its task ends.
struct Binding {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.inner.bindings.lock().remove(&self.id);
    }
}

pub(super) async fn open(inner: &Arc<Inner>, key: &ChildKey, field: ChildField) -> Result<FieldStream> {
    // Reject keys that cannot form a path before attaching anything.
    inner.field_path(key, field.as_str())?;
    let key = &inner.follow(key);

    let (changes, current) = attach(inner, key, field).await;
    let (value, observed) = render(inner, key, field, &current).await;
    remember(inner, key, field, &value, observed);

    let (tx, mut rx) = watch::channel(Some(FieldValue {
        key: key.clone(),
        value,
    }));
    rx.mark_changed();

    let id = inner.next_binding.fetch_add(1, Ordering::Relaxed);
    let (key_tx, key_rx) = watch::channel(key.clone());
    inner.bindings.lock().insert(id, key_tx);
    let binding = Binding {
        inner: Arc::clone(inner),
        id,
    };

    let task = Subscription {
        binding,
        field,
        key_rx,
        changes,
        last: Some(current),
        tx,
    }
    .run(inner.tasks.signal());
    inner.tasks.spawn("field", task);

    debug!("Observing {field} of {key}");
    Ok(FieldStream { field, rx })
}

fn path(inner: &Inner, key: &ChildKey, field: ChildField) -> StoreResult<TreePath> {
    inner.settings.root.child(key.as_str())?.child(field.as_str())
}

/// Listen on a field and read its current value, in that order.
async fn attach(
    inner: &Inner,
    key: &ChildKey,
    field: ChildField,
) -> (Option<broadcast::Receiver<ValueChange>>, ValueChange) {
    let path = match path(inner, key, field) {
        Ok(path) => path,
        Err(e) => return (None, Err(e)),
    };
    match inner.store.watch_value(&path).await {
        Ok(changes) => (Some(changes), inner.store.get(&path).await),
        Err(e) => {
            warn!("Failed to listen on {path}: {e}");
            (None, Err(e))
        }
    }
}

async fn read(inner: &Inner, key: &ChildKey, field: ChildField) -> ValueChange {
    inner.store.get(&path(inner, key, field)?).await
}

/// Turn a store delivery into the string to emit.
///
/// The flag is true when the string is a value actually stored in the
/// record rather than a placeholder or sentinel.
async fn render(inner: &Inner, key: &ChildKey, field: ChildField, change: &ValueChange) -> (String, bool) {
    let default_photo = &inner.settings.defaults.photo_url;
    match (field, change) {
        (ChildField::PhotoUrl, Ok(Some(Value::String(url)))) => {
            let url = checked_photo(inner, key, url).await;
            let observed = url != *default_photo;
            (url, observed)
        }
        (ChildField::PhotoUrl, Ok(_)) => (default_photo.clone(), false),
        (ChildField::PhotoUrl, Err(e)) => {
            debug!("{field} of {key} unavailable: {e}");
            (default_photo.clone(), false)
        }
        (_, Ok(Some(Value::String(text)))) => (text.clone(), true),
        (_, Ok(_)) => (LOADING.to_string(), false),
        (_, Err(e)) => {
            debug!("{field} of {key} unavailable: {e}");
            let sentinel = field.error_sentinel().unwrap_or(LOADING);
            (sentinel.to_string(), false)
        }
    }
}

/// Confirm a photo still exists, falling back to the default image.
///
/// An unrecognised URL, a missing object, or a failed check all reset the
/// record's photo to the default.
async fn checked_photo(inner: &Inner, key: &ChildKey, url: &str) -> String {
    let default_photo = &inner.settings.defaults.photo_url;
    if url.is_empty() || url == default_photo {
        return default_photo.clone();
    }

    let usable = match ObjectRef::parse(url) {
        Ok(object) => match inner.objects.exists(&object).await {
            Ok(exists) => {
                if !exists {
                    info!("Photo for {key} no longer exists: {object}");
                }
                exists
            }
            Err(e) => {
                warn!("Failed to check photo for {key}: {e}");
                false
            }
        },
        Err(e) => {
            info!("Photo for {key} is not usable: {e}");
            false
        }
    };

    if usable {
        url.to_string()
    } else {
        reset_photo(inner, key).await;
        default_photo.clone()
    }
}

/// Write the default photo back to a record that still exists.
async fn reset_photo(inner: &Inner, key: &ChildKey) {
    let Ok(record) = inner.record_path(key) else {
        return;
    };
    match inner.store.get(&record).await {
        Ok(Some(_)) => {}
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to read {key} before resetting its photo: {e}");
            return;
        }
    }

    let Ok(photo) = path(inner, key, ChildField::PhotoUrl) else {
        return;
    };
    let default_photo = json!(inner.settings.defaults.photo_url);
    match inner.store.set(&photo, default_photo).await {
        Ok(()) => info!("Reset photo of {key} to the default"),
        Err(e) => warn!("Failed to reset photo of {key}: {e}"),
    }
}

fn remember(inner: &Inner, key: &ChildKey, field: ChildField, value: &str, observed: bool) {
    match field {
        ChildField::DisplayName if observed => {
            inner
                .display_names
                .lock()
                .insert(key.clone(), value.to_string());
        }
        ChildField::PhotoUrl => {
            inner.photo_urls.lock().insert(key.clone(), value.to_string());
        }
        _ => {}
    }
}

/// Wait for the next change, or forever when there is no listener.
async fn next_change(
    changes: &mut Option<broadcast::Receiver<ValueChange>>,
) -> std::result::Result<ValueChange, RecvError> {
    match changes {
        Some(changes) => changes.recv().await,
        None => std::future::pending().await,
    }
}

/// The task state behind one [`FieldStream`].
struct Subscription {
    binding: Binding,
    field: ChildField,
    key_rx: watch::Receiver<ChildKey>,
    changes: Option<broadcast::Receiver<ValueChange>>,
    /// Last delivery rendered, to skip repeats.
    last: Option<ValueChange>,
    tx: watch::Sender<Option<FieldValue>>,
}

impl Subscription {
    async fn run(mut self, mut shutdown: ShutdownSignal) {
        let inner = Arc::clone(&self.binding.inner);
        let field = self.field;

        loop {
            let key = self.key_rx.borrow().clone();
            tokio::select! {
                biased;
                () = shutdown.wait() => break,
                () = self.tx.closed() => break,
                rebound = self.key_rx.changed() => {
                    if rebound.is_err() {
                        break;
                    }
                    let key = self.key_rx.borrow_and_update().clone();
                    debug!("{field} stream moving to {key}");
                    let (changes, current) = attach(&inner, &key, field).await;
                    self.changes = changes;
                    self.last = None;
                    self.emit(&inner, &key, current).await;
                }
                change = next_change(&mut self.changes) => match change {
                    Ok(change) => self.emit(&inner, &key, change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("{field} stream for {key} lagged by {skipped}");
                        let current = read(&inner, &key, field).await;
                        self.emit(&inner, &key, current).await;
                    }
                    Err(RecvError::Closed) => self.changes = None,
                },
            }
        }
        debug!("Stopped observing {field}");
    }

    async fn emit(&mut self, inner: &Inner, key: &ChildKey, change: ValueChange) {
        if self.last.as_ref() == Some(&change) {
            return;
        }
        let (value, observed) = render(inner, key, self.field, &change).await;
        self.last = Some(change);

        // Rebound while rendering; the new key takes over.
        if *self.key_rx.borrow() != *key {
            return;
        }

        remember(inner, key, self.field, &value, observed);
        let next = FieldValue {
            key: key.clone(),
            value,
        };
        self.tx.send_if_modified(move |current| {
            if current.as_ref() == Some(&next) {
                return false;
            }
            *current = Some(next);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{eventually, key, within, Fixture, DEFAULT_PHOTO};
    use crate::objects::ObjectRef;
    use crate::record::{ChildField, ChildStatus, LOADING};
    use crate::store::{TreePath, TreeStore};
    use serde_json::json;
    use std::time::Duration;

    const TOM_PHOTO: &str = "gs://bus-app/children/tom.png";

    fn path(p: &str) -> TreePath {
        TreePath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_first_value_is_immediate() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "eta": "5 min"
        }}}));
        let registry = fixture.open(&[]).await;

        let mut eta = registry.observe_field(&key("tom"), ChildField::Eta).await.unwrap();
        assert_eq!(eta.field(), ChildField::Eta);
        assert_eq!(eta.current().unwrap().value, "5 min");
        let first = within(eta.next()).await.unwrap();
        assert_eq!(first.value, "5 min");
        assert_eq!(first.key, key("tom"));

        drop(eta);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_missing_values_show_placeholders() {
        let fixture = Fixture::new();
        let registry = fixture.open(&[]).await;
        let nobody = key("nobody");

        for field in [ChildField::DisplayName, ChildField::Eta, ChildField::Status] {
            let mut stream = registry.observe_field(&nobody, field).await.unwrap();
            assert_eq!(within(stream.next()).await.unwrap().value, LOADING);
        }
        let mut photo = registry
            .observe_field(&nobody, ChildField::PhotoUrl)
            .await
            .unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, DEFAULT_PHOTO);

        // Nothing was written for the absent record.
        assert!(fixture.record("nobody").is_none());
        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_wrong_types_read_as_absent() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "eta": 5, "status": {"nested": true}
        }}}));
        let registry = fixture.open(&[]).await;

        let mut eta = registry.observe_field(&key("tom"), ChildField::Eta).await.unwrap();
        let mut status = registry.observe_field(&key("tom"), ChildField::Status).await.unwrap();
        assert_eq!(within(eta.next()).await.unwrap().value, LOADING);
        assert_eq!(within(status.next()).await.unwrap().value, LOADING);

        drop((eta, status));
        registry.close().await;
    }

    #[tokio::test]
    async fn test_emits_on_change_and_coalesces_repeats() {
        let fixture = Fixture::new();
        let registry = fixture.open(&["Tom"]).await;
        let tom = key("tom");

        let mut status = registry.observe_field(&tom, ChildField::Status).await.unwrap();
        assert_eq!(within(status.next()).await.unwrap().value, "On Route");

        registry.update_status(&tom, &ChildStatus::Boarded).await.unwrap();
        assert_eq!(within(status.next()).await.unwrap().value, "Boarded");

        // Same value again, then an unrelated field.
        registry.update_status(&tom, &ChildStatus::Boarded).await.unwrap();
        fixture
            .store
            .set(&path("children/tom/eta"), json!("2 min"))
            .await
            .unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(50), status.next()).await;
        assert!(nothing.is_err());

        drop(status);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_errors_emit_sentinels_and_recover() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "eta": "5 min", "status": "Boarded"
        }}}));
        let registry = fixture.open(&[]).await;
        let tom = key("tom");

        let mut eta = registry.observe_field(&tom, ChildField::Eta).await.unwrap();
        let mut name = registry.observe_field(&tom, ChildField::DisplayName).await.unwrap();
        within(eta.next()).await.unwrap();
        within(name.next()).await.unwrap();

        fixture.store.set_reachable(false);
        assert_eq!(within(eta.next()).await.unwrap().value, "Error loading ETA");
        assert_eq!(within(name.next()).await.unwrap().value, "Error loading name");

        fixture.store.set_reachable(true);
        assert_eq!(within(eta.next()).await.unwrap().value, "5 min");

        // Still streaming after the recovery.
        fixture
            .store
            .set(&path("children/tom/eta"), json!("1 min"))
            .await
            .unwrap();
        assert_eq!(within(eta.next()).await.unwrap().value, "1 min");

        drop((eta, name));
        registry.close().await;
    }

    #[tokio::test]
    async fn test_status_sentinel() {
        let fixture = Fixture::new();
        let registry = fixture.open(&["Tom"]).await;
        let mut status = registry.observe_field(&key("tom"), ChildField::Status).await.unwrap();
        within(status.next()).await.unwrap();

        fixture.store.set_reachable(false);
        assert_eq!(within(status.next()).await.unwrap().value, "Error loading status");

        fixture.store.set_reachable(true);
        drop(status);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_photo_that_exists_is_kept() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "photoUrl": TOM_PHOTO
        }}}));
        fixture.objects.insert(ObjectRef::parse(TOM_PHOTO).unwrap());
        let registry = fixture.open(&[]).await;

        let mut photo = registry.observe_field(&key("tom"), ChildField::PhotoUrl).await.unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, TOM_PHOTO);
        assert_eq!(fixture.record("tom").unwrap()["photoUrl"], TOM_PHOTO);
        assert_eq!(registry.cached_photo_url(&key("tom")).as_deref(), Some(TOM_PHOTO));

        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_missing_photo_self_heals() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "photoUrl": TOM_PHOTO
        }}}));
        let registry = fixture.open(&[]).await;

        let mut photo = registry.observe_field(&key("tom"), ChildField::PhotoUrl).await.unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, DEFAULT_PHOTO);
        eventually(|| fixture.record("tom").unwrap()["photoUrl"] == DEFAULT_PHOTO).await;

        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_unrecognised_photo_self_heals() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "photoUrl": "https://example.com/tom.png"
        }}}));
        let registry = fixture.open(&[]).await;

        let mut photo = registry.observe_field(&key("tom"), ChildField::PhotoUrl).await.unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, DEFAULT_PHOTO);
        eventually(|| fixture.record("tom").unwrap()["photoUrl"] == DEFAULT_PHOTO).await;

        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_photo_removed_later_self_heals() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {"displayName": "Tom"}}}));
        let registry = fixture.open(&[]).await;
        let mut photo = registry.observe_field(&key("tom"), ChildField::PhotoUrl).await.unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, DEFAULT_PHOTO);

        fixture
            .store
            .set(&path("children/tom/photoUrl"), json!(TOM_PHOTO))
            .await
            .unwrap();
        eventually(|| fixture.record("tom").unwrap()["photoUrl"] == DEFAULT_PHOTO).await;
        assert_eq!(photo.current().unwrap().value, DEFAULT_PHOTO);

        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_empty_photo_shows_default_without_writing() {
        let fixture = Fixture::with_tree(json!({"children": {"tom": {
            "displayName": "Tom", "photoUrl": ""
        }}}));
        let registry = fixture.open(&[]).await;

        let mut photo = registry.observe_field(&key("tom"), ChildField::PhotoUrl).await.unwrap();
        assert_eq!(within(photo.next()).await.unwrap().value, DEFAULT_PHOTO);
        assert_eq!(fixture.record("tom").unwrap()["photoUrl"], "");

        drop(photo);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        let fixture = Fixture::new();
        let registry = fixture.open(&["Tom"]).await;
        let mut eta = registry.observe_field(&key("tom"), ChildField::Eta).await.unwrap();
        within(eta.next()).await.unwrap();

        registry.close().await;
        assert_eq!(within(eta.next()).await, None);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_listener() {
        let fixture = Fixture::new();
        let registry = fixture.open(&["Tom"]).await;
        let before = fixture.store.listener_count();

        let eta = registry.observe_field(&key("tom"), ChildField::Eta).await.unwrap();
        assert_eq!(fixture.store.listener_count(), before + 1);

        drop(eta);
        eventually(|| fixture.store.listener_count() == before).await;
        registry.close().await;
    }
}
