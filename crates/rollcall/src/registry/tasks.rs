//! Ownership of the registry's background tasks.
//!
//! Every task the registry spawns is tracked by a [`TaskGroup`] and observes
//! a shared [`ShutdownSignal`]. Closing the group signals the tasks and waits
//! for them; dropping it signals and aborts them.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A cloneable view of the group's shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Check if shutdown has been signalled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is signalled.
    ///
    /// Also returns if the owning group is gone.
    pub async fn wait(&mut self) {
        // An error means the sender is gone, which is a shutdown as well.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// A set of tasks sharing one shutdown signal.
#[derive(Debug)]
pub struct TaskGroup {
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Get a shutdown signal for a task.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.stop.subscribe(),
        }
    }

    /// Check if shutdown has been signalled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.stop.borrow()
    }

    /// Spawn a task into the group.
    ///
    /// Returns `false`, without spawning, once shutdown has been signalled.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();
        if self.is_shutdown() {
            debug!("Not spawning {name} task after shutdown");
            return false;
        }
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(task));
        true
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Number of tasks that have not finished yet.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn close(&self) {
        self.shutdown();
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        warn!("Registry task panicked: {e}");
                    }
                }
            }
        }
    }

    /// Abort every task without waiting.
    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.shutdown();
        self.abort_all();
    }
}
