//! Per-node execution profiling.

use hyflow_core::types::{NodeId, StageId};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;

/// One profiled node execution. Times are microseconds since the profiler
/// was created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEntry {
    /// Executed node.
    pub node: NodeId,
    /// Its operator type.
    pub op_type: String,
    /// Stage that ran it.
    pub stage: StageId,
    /// Loop iteration.
    pub iteration: u64,
    /// When the node left the dispatcher.
    pub dispatched_us: u64,
    /// When its completion callback ran.
    pub completed_us: u64,
    /// Whether it succeeded.
    pub success: bool,
}

/// Collects [`ProfileEntry`] records from completion callbacks.
#[derive(Debug)]
pub struct Profiler {
    epoch: Instant,
    entries: Mutex<Vec<ProfileEntry>>,
}

impl Profiler {
    /// Create an empty profiler.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Microseconds from the profiler epoch to `at`.
    pub fn offset_us(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    /// Append an entry.
    pub fn record(&self, entry: ProfileEntry) {
        self.entries.lock().push(entry);
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<ProfileEntry> {
        self.entries.lock().clone()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Entries as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.entries.lock())
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_serializes() {
        let profiler = Profiler::new();
        let now = Instant::now();
        profiler.record(ProfileEntry {
            node: NodeId::new(1),
            op_type: "Abs".to_string(),
            stage: StageId::new(0),
            iteration: 0,
            dispatched_us: profiler.offset_us(now),
            completed_us: profiler.offset_us(now),
            success: true,
        });
        assert_eq!(profiler.entries().len(), 1);
        let json = profiler.to_json().unwrap();
        assert!(json.contains("\"op_type\":\"Abs\""));
        profiler.clear();
        assert!(profiler.entries().is_empty());
    }
}
