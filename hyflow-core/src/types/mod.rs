//! Core identifier types.
//!
//! - `RunId`: unique identifier for one run
//! - `NodeId`, `FrameId`: dense indices into the per-subgraph arenas
//! - `StageId`, `StreamId`, `GroupId`: pipeline, device and grouping handles

mod ids;

pub use ids::{FrameId, GroupId, NodeId, RunId, StageId, StreamId};
