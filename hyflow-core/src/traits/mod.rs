//! Core traits for hyflow plug-ins.
//!
//! - `NodeExecutor`: an engine, looked up by tag
//! - `NodeTask`: the executable form of one node

mod kernel;

pub use kernel::{
    DoneCallback, NodeExecutor, NodeExecutorFactory, NodeTask, OutputTensor, TaskContext,
    TaskHandle,
};
