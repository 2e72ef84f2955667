//! Key reconciliation.
//!
//! A record whose display name no longer normalizes to its key is moved to
//! the key it should have: the value is copied to the new key, open field
//! streams are pointed at the new key, and the old key is deleted after the
//! settling delay. Both keys are visible to readers in between.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::tasks::ShutdownSignal;
use super::Inner;
use crate::error::Result;
use crate::key::ChildKey;
use crate::record::ChildRecord;
use crate::store::ValueChange;

/// How a single rename ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Copied, rebound, and the old key deleted.
    Renamed,
    /// The old key held nothing by the time it was read.
    NothingToMove,
    /// Reading the old key failed.
    ReadFailed,
    /// Writing the new key failed. The old key is untouched.
    CopyFailed,
    /// Deleting the old key failed. Both keys now hold the record.
    DeleteFailed,
    /// The session closed during the settling delay. The delete was dropped.
    DeleteDropped,
}

/// Attach the collection listener and spawn the reconciler.
pub(super) async fn start(inner: &Arc<Inner>) -> Result<()> {
    let changes = inner.store.watch_value(&inner.settings.root).await?;
    let task = run(Arc::clone(inner), changes, inner.tasks.signal());
    inner.tasks.spawn("reconciler", task);
    Ok(())
}

async fn run(
    inner: Arc<Inner>,
    mut changes: broadcast::Receiver<ValueChange>,
    mut shutdown: ShutdownSignal,
) {
    pass_current(&inner).await;

    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            change = changes.recv() => match change {
                Ok(Ok(value)) => {
                    pass(&inner, value.as_ref());
                }
                Ok(Err(e)) => debug!("Collection listener error: {e}"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Reconciler lagged by {skipped} snapshot(s)");
                    pass_current(&inner).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Reconciler stopped");
}

async fn pass_current(inner: &Arc<Inner>) {
    match inner.store.get(&inner.settings.root).await {
        Ok(value) => {
            pass(inner, value.as_ref());
        }
        Err(e) => warn!("Failed to read {} for reconciliation: {e}", inner.settings.root),
    }
}

/// Check every record in a collection snapshot and start a rename for each
/// one stored under the wrong key.
///
/// Records without a usable display name are left alone, as are keys that
/// already have a rename in progress or whose earlier delete failed. Returns the number of renames started.
pub(super) fn pass(inner: &Arc<Inner>, collection: Option<&Value>) -> usize {
    let Some(records) = collection.and_then(Value::as_object) else {
        return 0;
    };

    let mut started = 0;
    for (stored, value) in records {
        let Some(key) = ChildKey::from_stored(stored.as_str()) else {
            continue;
        };
        let Some(record) = ChildRecord::from_value(key, value) else {
            continue;
        };
        let Some(expected) = record.expected_key() else {
            continue;
        };
        if expected != record.key && begin(inner, record.key, expected) {
            started += 1;
        }
    }
    started
}

/// Marks a rename in flight until dropped.
struct InFlight {
    inner: Arc<Inner>,
    old: ChildKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.renames.send_modify(|pending| {
            pending.remove(&self.old);
        });
    }
}

fn begin(inner: &Arc<Inner>, old: ChildKey, new: ChildKey) -> bool {
    if inner.orphaned.lock().contains(&old) {
        return false;
    }
    let claimed = inner.renames.send_if_modified(|pending| {
        if pending.contains_key(&old) {
            return false;
        }
        pending.insert(old.clone(), None);
        true
    });
    if !claimed {
        return false;
    }
    let guard = InFlight {
        inner: Arc::clone(inner),
        old,
    };

    info!("Renaming {} to {new}", guard.old);
    let shutdown = inner.tasks.signal();
    inner.tasks.spawn("rename", async move {
        let outcome = rename(&guard.inner, &guard.old, &new, shutdown).await;
        if outcome == RenameOutcome::DeleteFailed {
            guard.inner.orphaned.lock().insert(guard.old.clone());
        }
        debug!("Rename of {} to {new} finished: {outcome:?}", guard.old);
    })
}

/// Move the record at `old` to `new`.
pub(super) async fn rename(
    inner: &Inner,
    old: &ChildKey,
    new: &ChildKey,
    mut shutdown: ShutdownSignal,
) -> RenameOutcome {
    let (old_path, new_path) = match (inner.record_path(old), inner.record_path(new)) {
        (Ok(old_path), Ok(new_path)) => (old_path, new_path),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Cannot rename {old} to {new}: {e}");
            return RenameOutcome::CopyFailed;
        }
    };

    let value = match inner.store.get(&old_path).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!("Nothing left at {old} to rename");
            return RenameOutcome::NothingToMove;
        }
        Err(e) => {
            warn!("Failed to read {old} for rename: {e}");
            return RenameOutcome::ReadFailed;
        }
    };

    if let Err(e) = inner.store.set(&new_path, value).await {
        warn!("Failed to copy {old} to {new}: {e}");
        return RenameOutcome::CopyFailed;
    }

    inner.renames.send_if_modified(|pending| match pending.get_mut(old) {
        Some(target) => {
            *target = Some(new.clone());
            true
        }
        None => false,
    });
    inner.rebind(old, new);

    tokio::select! {
        () = tokio::time::sleep(inner.settings.settling_delay) => {}
        () = shutdown.wait() => {
            info!("Session closed before {old} could be deleted; left in place");
            return RenameOutcome::DeleteDropped;
        }
    }

    // Catch streams opened on the old key during the delay.
    inner.rebind(old, new);

    if let Err(e) = inner.store.remove(&old_path).await {
        warn!("Failed to delete {old} after renaming it to {new}, leaving both for this session: {e}");
        return RenameOutcome::DeleteFailed;
    }

    info!("Renamed {old} to {new}");
    RenameOutcome::Renamed
}
