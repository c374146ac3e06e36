//! Stage-pipelined execution across several streams.
//!
//! - [`StageSubject`] - counting barrier between neighbouring stages
//! - [`StageExecutor`] - one stage with its own worker thread
//! - [`PipelineCoordinator`] - feeds iterations and collects outputs

mod coordinator;
mod stage;
mod subject;

pub use coordinator::{PipelineCoordinator, PipelineOutcome, PipelinePhase};
pub use stage::{StageExecutor, StageTask};
pub use subject::StageSubject;
