//! Host emulation of the device runtime.
//!
//! Every [`HostStream`] is a FIFO worker thread, events are condvar flags
//! signalled from that thread, and memory comes from the process heap.

use super::{
    Allocator, AllocatorStats, DeviceRuntime, Event, MemoryBlock, StorageType, Stream, StreamWork,
};
use crate::error::{HyflowError, Result};
use crate::types::StreamId;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Allocator
// ============================================================================

/// Heap-backed allocator with live-memory accounting.
#[derive(Debug, Default)]
pub struct HostAllocator {
    next_id: AtomicU64,
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
    limit_bytes: Option<usize>,
}

impl HostAllocator {
    /// Create an unbounded allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that fails once `limit_bytes` would be exceeded.
    #[must_use]
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: Some(limit_bytes),
            ..Self::default()
        }
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, size: usize, storage: StorageType) -> Result<MemoryBlock> {
        let reserved = storage.reserved_size(size);
        if let Some(limit) = self.limit_bytes {
            let live = self.live_bytes.load(Ordering::Acquire);
            if live.saturating_add(reserved) > limit {
                return Err(HyflowError::Allocation {
                    requested: size,
                    storage,
                    cause: format!("{live} of {limit} bytes already in use"),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live_blocks.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(reserved, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryBlock::zeroed(id, storage, size))
    }

    fn free(&self, block: MemoryBlock) {
        self.live_blocks.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(block.reserved(), Ordering::AcqRel);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_blocks: self.live_blocks.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// A one-shot completion flag.
#[derive(Debug, Default)]
pub struct HostEvent {
    complete: Mutex<bool>,
    cond: Condvar,
}

impl HostEvent {
    /// Create an event that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the event complete and wake every waiter.
    pub fn signal(&self) {
        let mut complete = self.complete.lock();
        *complete = true;
        self.cond.notify_all();
    }
}

impl Event for HostEvent {
    fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut complete = self.complete.lock();
        while !*complete {
            if self.cond.wait_until(&mut complete, deadline).timed_out() && !*complete {
                return Err(HyflowError::Timeout {
                    operation: "event wait".to_string(),
                    timeout_ms: duration_ms(timeout),
                });
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        *self.complete.lock()
    }
}

// ============================================================================
// Stream
// ============================================================================

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

#[derive(Debug, Default)]
struct StreamShared {
    progress: Mutex<Progress>,
    cond: Condvar,
}

/// A stream backed by one worker thread that runs submissions in order.
#[derive(Debug)]
pub struct HostStream {
    id: StreamId,
    sender: Mutex<Option<mpsc::Sender<StreamWork>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<StreamShared>,
}

impl HostStream {
    /// Spawn the worker thread for a new stream.
    pub fn spawn(id: StreamId) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<StreamWork>();
        let shared = Arc::new(StreamShared::default());
        let worker_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name(format!("hyflow-{id}"))
            .spawn(move || run_stream(id, rx, worker_shared))
            .map_err(|e| HyflowError::StreamFailure {
                stream: id,
                cause: format!("failed to spawn worker: {e}"),
            })?;

        tracing::debug!(stream = %id, "Host stream created");

        Ok(Self {
            id,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            shared,
        })
    }

    /// Number of submissions not yet completed.
    #[must_use]
    pub fn pending(&self) -> u64 {
        let progress = self.shared.progress.lock();
        progress.submitted - progress.completed
    }
}

fn run_stream(id: StreamId, rx: mpsc::Receiver<StreamWork>, shared: Arc<StreamShared>) {
    for work in rx {
        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            tracing::error!(stream = %id, "Stream work panicked");
        }
        let mut progress = shared.progress.lock();
        progress.completed += 1;
        shared.cond.notify_all();
    }
    tracing::debug!(stream = %id, "Host stream worker exiting");
}

impl Stream for HostStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn launch(&self, work: StreamWork) -> Result<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(HyflowError::StreamDestroyed { stream: self.id });
        };

        self.shared.progress.lock().submitted += 1;
        if tx.send(work).is_err() {
            let mut progress = self.shared.progress.lock();
            progress.submitted -= 1;
            return Err(HyflowError::StreamDestroyed { stream: self.id });
        }
        Ok(())
    }

    fn record_event(&self) -> Result<Arc<dyn Event>> {
        let event = Arc::new(HostEvent::new());
        let signal = Arc::clone(&event);
        self.launch(Box::new(move || signal.signal()))?;
        Ok(event)
    }

    fn synchronize(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        let target = progress.submitted;
        while progress.completed < target {
            if self
                .shared
                .cond
                .wait_until(&mut progress, deadline)
                .timed_out()
                && progress.completed < target
            {
                return Err(HyflowError::Timeout {
                    operation: format!("{} synchronize", self.id),
                    timeout_ms: duration_ms(timeout),
                });
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        // Dropping the sender lets the worker finish queued work and exit.
        let had_sender = self.sender.lock().take().is_some();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(stream = %self.id, "Stream worker panicked during shutdown");
            }
        }
        if had_sender {
            tracing::debug!(stream = %self.id, "Host stream destroyed");
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Device runtime that executes everything on host threads.
#[derive(Debug)]
pub struct HostRuntime {
    allocator: Arc<HostAllocator>,
    next_stream: AtomicU32,
}

impl HostRuntime {
    /// Create a runtime with an unbounded allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(HostAllocator::new())
    }

    /// Create a runtime whose allocator fails beyond `limit_bytes`.
    #[must_use]
    pub fn with_memory_limit(limit_bytes: usize) -> Self {
        Self::with_allocator(HostAllocator::with_limit(limit_bytes))
    }

    fn with_allocator(allocator: HostAllocator) -> Self {
        Self {
            allocator: Arc::new(allocator),
            next_stream: AtomicU32::new(0),
        }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for HostRuntime {
    fn create_stream(&self) -> Result<Arc<dyn Stream>> {
        let id = StreamId::new(self.next_stream.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(HostStream::spawn(id)?))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator) as Arc<dyn Allocator>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn stream_runs_work_in_submission_order() {
        let stream = HostStream::spawn(StreamId::new(0)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            stream.launch(Box::new(move || order.lock().push(i))).unwrap();
        }
        stream.synchronize(WAIT).unwrap();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn event_fires_after_prior_work() {
        let stream = HostStream::spawn(StreamId::new(1)).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        stream
            .launch(Box::new(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
            }))
            .unwrap();
        let event = stream.record_event().unwrap();
        event.wait(WAIT).unwrap();
        assert!(event.is_complete());
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn synchronize_times_out_on_slow_work() {
        let stream = HostStream::spawn(StreamId::new(2)).unwrap();
        stream
            .launch(Box::new(|| thread::sleep(Duration::from_millis(200))))
            .unwrap();
        let err = stream.synchronize(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
        stream.synchronize(WAIT).unwrap();
    }

    #[test]
    fn launch_after_destroy_fails() {
        let stream = HostStream::spawn(StreamId::new(3)).unwrap();
        stream.destroy();
        let err = stream.launch(Box::new(|| {})).unwrap_err();
        assert_eq!(err.code(), "E204");
    }

    #[test]
    fn panicking_work_does_not_kill_stream() {
        let stream = HostStream::spawn(StreamId::new(4)).unwrap();
        stream.launch(Box::new(|| panic!("kernel bug"))).unwrap();
        let event = stream.record_event().unwrap();
        event.wait(WAIT).unwrap();
    }

    #[test]
    fn allocator_tracks_live_memory() {
        let allocator = HostAllocator::new();
        let a = allocator.allocate(10, StorageType::Host).unwrap();
        let b = allocator.allocate(10, StorageType::Aligned).unwrap();
        assert_eq!(b.reserved(), 64);
        assert_eq!(allocator.stats().live_bytes, 74);
        allocator.free(a);
        allocator.free(b);
        let stats = allocator.stats();
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_frees, 2);
    }

    #[test]
    fn allocator_limit() {
        let allocator = HostAllocator::with_limit(16);
        let block = allocator.allocate(16, StorageType::Device).unwrap();
        let err = allocator.allocate(1, StorageType::Device).unwrap_err();
        assert_eq!(err.code(), "E201");
        allocator.free(block);
        assert!(allocator.allocate(1, StorageType::Device).is_ok());
    }

    #[test]
    fn runtime_assigns_distinct_stream_ids() {
        let runtime = HostRuntime::new();
        let s0 = runtime.create_stream().unwrap();
        let s1 = runtime.create_stream().unwrap();
        assert_ne!(s0.id(), s1.id());
    }
}
