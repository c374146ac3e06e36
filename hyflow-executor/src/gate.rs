//! Per-node completion gates.
//!
//! A [`CompletionGate`] is a one-shot, resettable signal: consumers block in
//! [`CompletionGate::await_done`] until the producing node's completion
//! callback calls [`CompletionGate::release`], or until the run is torn down
//! with [`CompletionGate::cancel`]. Cancellation is sticky for the rest of the
//! run: only [`CompletionGate::rearm`], called when a new run starts, leaves
//! the cancelled state.

use hyflow_core::error::{HyflowError, Result};
use hyflow_core::types::NodeId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// State of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// The node has not completed.
    Unreleased,
    /// The node completed and its outputs are propagated.
    Released,
    /// The run was aborted. Final until re-armed.
    Cancelled,
}

/// What a waiter observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The gate was released.
    Released,
    /// The gate was cancelled.
    Cancelled,
}

/// One-shot wait/signal primitive with cancellation.
#[derive(Debug)]
pub struct CompletionGate {
    state: Mutex<GateState>,
    cond: Condvar,
    releases: AtomicU64,
}

impl CompletionGate {
    /// Create an unreleased gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Unreleased),
            cond: Condvar::new(),
            releases: AtomicU64::new(0),
        }
    }

    /// Block until released or cancelled. Returns at once if that already
    /// happened.
    pub fn await_done(&self) -> GateOutcome {
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Released => return GateOutcome::Released,
                GateState::Cancelled => return GateOutcome::Cancelled,
                GateState::Unreleased => self.cond.wait(&mut state),
            }
        }
    }

    /// Like [`CompletionGate::await_done`], giving up after `timeout`.
    pub fn await_timeout(&self, timeout: Duration) -> Option<GateOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Released => return Some(GateOutcome::Released),
                GateState::Cancelled => return Some(GateOutcome::Cancelled),
                GateState::Unreleased => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && *state == GateState::Unreleased
                    {
                        return None;
                    }
                }
            }
        }
    }

    /// Unreleased to Released, waking every waiter. Returns whether this call
    /// changed the state; releasing twice or after cancellation is a no-op.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        if *state != GateState::Unreleased {
            return false;
        }
        *state = GateState::Released;
        self.releases.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
        true
    }

    /// Any state to Cancelled, waking every waiter.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        *state = GateState::Cancelled;
        self.cond.notify_all();
    }

    /// Released to Unreleased for the next iteration. Must not race with
    /// waiters. Has no effect on a cancelled gate.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Released {
            *state = GateState::Unreleased;
        }
    }

    /// Return to Unreleased from any state. Only valid when a new run starts.
    pub fn rearm(&self) {
        *self.state.lock() = GateState::Unreleased;
        self.releases.store(0, Ordering::Release);
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    /// Number of effective releases since the last re-arm.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One gate per node of a subgraph.
#[derive(Debug)]
pub struct GateSet {
    gates: Vec<CompletionGate>,
    aborted: AtomicBool,
}

impl GateSet {
    /// Create `count` unreleased gates.
    pub fn new(count: usize) -> Self {
        Self {
            gates: (0..count).map(|_| CompletionGate::new()).collect(),
            aborted: AtomicBool::new(false),
        }
    }

    fn gate(&self, node: NodeId) -> Result<&CompletionGate> {
        self.gates
            .get(node.index())
            .ok_or(HyflowError::SlotOutOfRange {
                slot: "gate",
                index: node.index(),
                limit: self.gates.len(),
            })
    }

    /// Block until `node` completes. Fails with `Cancelled` once the set is
    /// aborted.
    pub fn await_node(&self, node: NodeId) -> Result<()> {
        let gate = self.gate(node)?;
        if self.aborted.load(Ordering::Acquire) {
            return Err(HyflowError::Cancelled { node });
        }
        match gate.await_done() {
            GateOutcome::Released => Ok(()),
            GateOutcome::Cancelled => Err(HyflowError::Cancelled { node }),
        }
    }

    /// Release `node`'s gate.
    pub fn node_done(&self, node: NodeId) -> Result<()> {
        self.gate(node)?.release();
        Ok(())
    }

    /// Cancel every gate. Current and future awaits fail without blocking.
    pub fn cancel_all(&self) {
        self.aborted.store(true, Ordering::Release);
        for gate in &self.gates {
            gate.cancel();
        }
    }

    /// Whether [`GateSet::cancel_all`] was called since the last re-arm.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Reset every released gate for the next iteration. Cancelled gates stay
    /// cancelled.
    pub fn reset(&self) {
        for gate in &self.gates {
            gate.reset();
        }
    }

    /// Re-arm every gate for a new run.
    pub fn rearm(&self) {
        self.aborted.store(false, Ordering::Release);
        for gate in &self.gates {
            gate.rearm();
        }
    }

    /// State of `node`'s gate.
    pub fn state(&self, node: NodeId) -> Result<GateState> {
        Ok(self.gate(node)?.state())
    }

    /// Effective releases of `node`'s gate since the last re-arm.
    pub fn release_count(&self, node: NodeId) -> Result<u64> {
        Ok(self.gate(node)?.release_count())
    }

    /// Number of gates.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether the set has no gates.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_before_await_does_not_block() {
        let gate = CompletionGate::new();
        assert!(gate.release());
        assert!(!gate.release());
        assert_eq!(gate.release_count(), 1);
        assert_eq!(gate.await_done(), GateOutcome::Released);
        assert_eq!(gate.await_done(), GateOutcome::Released);
    }

    #[test]
    fn release_wakes_waiters() {
        let gate = Arc::new(CompletionGate::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.await_done())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        gate.release();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), GateOutcome::Released);
        }
    }

    #[test]
    fn cancel_is_sticky_across_reset() {
        let gate = CompletionGate::new();
        gate.cancel();
        gate.reset();
        assert_eq!(gate.state(), GateState::Cancelled);
        assert!(!gate.release());
        assert_eq!(gate.await_done(), GateOutcome::Cancelled);

        gate.rearm();
        assert_eq!(gate.state(), GateState::Unreleased);
    }

    #[test]
    fn reset_returns_released_to_unreleased() {
        let gate = CompletionGate::new();
        gate.release();
        gate.reset();
        assert_eq!(gate.state(), GateState::Unreleased);
        assert_eq!(gate.await_timeout(Duration::from_millis(10)), None);
        gate.release();
        assert_eq!(gate.release_count(), 2);
    }

    #[test]
    fn cancel_all_unblocks_current_and_future_waiters() {
        let set = Arc::new(GateSet::new(3));
        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let set = Arc::clone(&set);
                thread::spawn(move || set.await_node(NodeId::new(i)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        set.cancel_all();
        for waiter in waiters {
            assert!(matches!(
                waiter.join().unwrap(),
                Err(HyflowError::Cancelled { .. })
            ));
        }

        set.node_done(NodeId::new(0)).unwrap();
        assert!(set.await_node(NodeId::new(0)).is_err());
        set.reset();
        assert!(set.is_aborted());
        assert!(set.await_node(NodeId::new(1)).is_err());
    }

    #[test]
    fn out_of_range_node() {
        let set = GateSet::new(1);
        let err = set.node_done(NodeId::new(4)).unwrap_err();
        assert_eq!(err.code(), "E001");
    }
}
