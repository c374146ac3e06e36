//! Callback bridge: turns stream completion events into host callbacks.
//!
//! Each bridge owns one worker thread and a FIFO of `(event, callback)`
//! pairs. The worker waits for each event in turn and then runs its callback,
//! so callbacks of one bridge run strictly in registration order regardless
//! of the order in which the device finishes work.

use hyflow_core::device::{Event, Stream};
use hyflow_core::error::{HyflowError, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Host-side completion callback. Receives the event wait result.
pub type BridgeCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

struct Entry {
    event: Arc<dyn Event>,
    callback: BridgeCallback,
}

/// FIFO callback worker bound to one execution context.
#[derive(Debug)]
pub struct CallbackBridge {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Entry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl CallbackBridge {
    /// Spawn the bridge worker. Every event wait gives up after
    /// `event_timeout`.
    pub fn new(name: impl Into<String>, event_timeout: Duration) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Entry>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let worker_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("hyflow-bridge-{name}"))
            .spawn(move || run_bridge(&worker_name, rx, worker_pending, event_timeout))
            .map_err(|e| HyflowError::InvalidState {
                component: format!("callback bridge {name}"),
                cause: format!("failed to spawn worker: {e}"),
            })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            pending,
        })
    }

    /// Record an event on `stream` and queue `callback` behind it.
    ///
    /// The callback runs exactly once. When registration fails (the bridge
    /// is destroyed or the event cannot be recorded) it runs immediately on
    /// the calling thread with the error, and the same error is returned.
    pub fn register_callback(&self, stream: &dyn Stream, callback: BridgeCallback) -> Result<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            drop(sender);
            let err = self.destroyed_error();
            callback(Err(err.clone()));
            return Err(err);
        };

        let event = match stream.record_event() {
            Ok(event) => event,
            Err(err) => {
                drop(sender);
                callback(Err(err.clone()));
                return Err(err);
            }
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::SendError(entry)) = tx.send(Entry { event, callback }) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            drop(sender);
            let err = self.destroyed_error();
            (entry.callback)(Err(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Callbacks registered but not yet run.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether [`CallbackBridge::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Reject new registrations, run every queued callback and join the
    /// worker. No callback runs after this returns.
    pub fn destroy(&self) {
        let had_sender = self.sender.lock().take().is_some();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            tracing::warn!(bridge = %self.name, "Bridge destroyed from its own callback");
            return;
        }
        if handle.join().is_err() {
            tracing::error!(bridge = %self.name, "Bridge worker panicked");
        }
        if had_sender {
            tracing::debug!(bridge = %self.name, "Callback bridge destroyed");
        }
    }

    fn destroyed_error(&self) -> HyflowError {
        HyflowError::InvalidState {
            component: format!("callback bridge {}", self.name),
            cause: "bridge has been destroyed".to_string(),
        }
    }
}

impl Drop for CallbackBridge {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_bridge(
    name: &str,
    rx: mpsc::Receiver<Entry>,
    pending: Arc<AtomicUsize>,
    event_timeout: Duration,
) {
    for Entry { event, callback } in rx {
        let waited = event.wait(event_timeout);
        if let Err(err) = &waited {
            tracing::warn!(bridge = %name, error = %err, "Event wait failed");
        }
        if panic::catch_unwind(AssertUnwindSafe(|| callback(waited))).is_err() {
            tracing::error!(bridge = %name, "Completion callback panicked");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!(bridge = %name, "Bridge worker exiting");
}
