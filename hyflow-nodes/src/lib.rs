//! Host kernel library for hyflow.
//!
//! Provides the `host` engine, whose kernels run on host streams:
//!
//! ## Boundaries and copies (`memory`)
//! - `Data` / `Output` - graph input and output boundaries
//! - `Identity` - forwards its input
//! - `Load` / `Store` - copy between host and device storage
//!
//! ## Arithmetic (`math`)
//! - `Abs`, `Neg`, `Relu` - unary elementwise `f32`
//! - `Add`, `Mul` - binary elementwise `f32`
//!
//! ## Data flow (`queue`)
//! - `Enqueue` / `Dequeue` - FIFO resources keyed by the `handle` attribute;
//!   dequeuing from an empty resource ends the sequence
//!
//! Register the engine with [`register_host_kernels`] before loading a graph
//! whose nodes name the [`HOST_ENGINE`] tag.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod math;
pub mod memory;
pub mod queue;

pub use engine::{register_host_kernels, HostKernelExecutor, HostOp, HostTask, HOST_ENGINE};
pub use math::{BinaryOp, UnaryOp};
pub use queue::{QueueRef, DEFAULT_CAPACITY};

/// Codes reported in `KernelExecution` failures of host kernels.
pub mod codes {
    /// An input has an element type the kernel does not handle.
    pub const UNSUPPORTED_DTYPE: u32 = 1;
    /// Operand shapes disagree.
    pub const SHAPE_MISMATCH: u32 = 2;
    /// A buffer does not have the expected number of bytes.
    pub const SIZE_MISMATCH: u32 = 3;
}

/// Prelude for commonly used types.
pub mod prelude {
    pub use crate::codes;
    pub use crate::engine::{
        register_host_kernels, HostKernelExecutor, HostOp, HostTask, HOST_ENGINE,
    };
    pub use crate::math::{BinaryOp, UnaryOp};
    pub use crate::queue::QueueRef;
}
