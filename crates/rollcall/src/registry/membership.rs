//! Live key set tracking.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::tasks::ShutdownSignal;
use super::Inner;
use crate::error::Result;
use crate::key::ChildKey;
use crate::store::{child_keys, ChildEvent};

/// Attach the child listener and seed the key set.
///
/// The listener is attached before the initial read so no change falls in
/// between. If the read fails the set is rebuilt on the next event.
pub(super) async fn start(inner: &Arc<Inner>) -> Result<()> {
    let events = inner.store.watch_children(&inner.settings.root).await?;
    let resync = !refresh(inner).await;

    let task = run(Arc::clone(inner), events, inner.tasks.signal(), resync);
    inner.tasks.spawn("membership", task);
    Ok(())
}

/// Replace the key set with what the store holds now.
async fn refresh(inner: &Inner) -> bool {
    match inner.store.get(&inner.settings.root).await {
        Ok(value) => {
            let keys: BTreeSet<ChildKey> = child_keys(value.as_ref())
                .into_iter()
                .filter_map(ChildKey::from_stored)
                .collect();
            debug!("Live keys refreshed: {} key(s)", keys.len());
            inner.live_keys.send_replace(keys);
            true
        }
        Err(e) => {
            warn!("Failed to read {}: {e}", inner.settings.root);
            false
        }
    }
}

async fn run(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<ChildEvent>,
    mut shutdown: ShutdownSignal,
    mut resync: bool,
) {
    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            event = events.recv() => match event {
                Ok(_) if resync => resync = !refresh(&inner).await,
                Ok(ChildEvent::Added(key)) => {
                    if let Some(key) = ChildKey::from_stored(key) {
                        debug!("Child added: {key}");
                        inner.live_keys.send_if_modified(|keys| keys.insert(key));
                    }
                }
                Ok(ChildEvent::Removed(key)) => {
                    if let Some(key) = ChildKey::from_stored(key) {
                        debug!("Child removed: {key}");
                        inner.live_keys.send_if_modified(|keys| keys.remove(&key));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Membership listener lagged by {skipped} event(s)");
                    resync = !refresh(&inner).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Membership listener stopped");
}
