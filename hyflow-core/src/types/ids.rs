//! Strongly-typed identifiers for hyflow entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one run (a single `execute` or one queued request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a run ID from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// Declares a `u32` newtype identifier that doubles as an arena index.
macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Create a new ID from a raw value.
            #[must_use]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Get the raw ID value.
            #[must_use]
            pub const fn as_u32(&self) -> u32 {
                self.0
            }

            /// Get the ID as an arena index.
            #[must_use]
            pub const fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }
    };
}

index_id!(
    /// Identifier for a node within a graph.
    ///
    /// Node IDs are dense: node `n` is stored at index `n` of every per-node table.
    NodeId,
    "node"
);

index_id!(
    /// Identifier for a control-flow frame. Frame 0 is the root frame.
    FrameId,
    "frame"
);

index_id!(
    /// Identifier for a pipeline stage.
    StageId,
    "stage"
);

index_id!(
    /// Identifier for a device stream.
    StreamId,
    "stream"
);

index_id!(
    /// Identifier for an execution group.
    GroupId,
    "group"
);

impl FrameId {
    /// The root frame every graph has.
    pub const ROOT: FrameId = FrameId(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_unique() {
        let id1 = RunId::new();
        let id2 = RunId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("run_"));
    }

    #[test]
    fn index_id_display() {
        assert_eq!(NodeId::new(42).to_string(), "node_42");
        assert_eq!(StageId::new(1).to_string(), "stage_1");
        assert_eq!(FrameId::ROOT.to_string(), "frame_0");
    }

    #[test]
    fn index_ids_order_by_value() {
        assert!(NodeId::new(1) < NodeId::new(2));
        assert_eq!(NodeId::new(7).index(), 7);
    }

    #[test]
    fn node_id_serializes_as_number() {
        let json = serde_json::to_string(&NodeId::new(3)).unwrap();
        assert_eq!(json, "3");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId::new(3));
    }
}
