//! hyflow core library
//!
//! Foundational types shared by the hyflow executor and kernel libraries.
//!
//! # Key Components
//!
//! - **Graph**: validated, immutable dataflow graph with slot layout and a
//!   deterministic execution order
//! - **Tensor**: tensor values that either own an allocator-backed buffer or
//!   reference external memory
//! - **Device**: stream, event and allocator traits plus a host runtime
//! - **Traits**: the `NodeExecutor` / `NodeTask` kernel plug-in interface
//! - **Resource**: handle-keyed stateful containers for data-flow operators
//!
//! # Example
//!
//! ```
//! use hyflow_core::prelude::*;
//!
//! let mut builder = GraphBuilder::new("abs");
//! let x = builder.add_data("x", TensorDesc::new(DataType::F32, vec![4]));
//! builder.mark_output(x, 0);
//! let graph = builder.build()?;
//! assert_eq!(graph.data_nodes(), &[x]);
//! # Ok::<(), HyflowError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod graph;
pub mod prelude;
pub mod resource;
pub mod tensor;
pub mod traits;
pub mod types;

// Re-export key types at crate root for convenience
pub use error::{HyflowError, Result};
pub use graph::{Graph, GraphBuilder, NodeDescriptor};
pub use tensor::{TensorDesc, TensorValue};
pub use types::{NodeId, RunId};
