//! Data movement: graph boundaries, host/device copies and identity.

use crate::codes;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::traits::{OutputTensor, TaskHandle};

/// Write input 0 into output 0.
///
/// An aliased output already forwards the input, so there is nothing to do.
/// A buffer output receives a byte copy, which is how `Load` and `Store`
/// move data between host and device storage.
pub(crate) fn forward(handle: &mut TaskHandle) -> Result<()> {
    if matches!(handle.outputs.first(), Some(OutputTensor::Alias { .. })) {
        return Ok(());
    }
    let node = handle.node;
    let source = handle.input(0)?.clone();
    let out = handle.output_mut(0)?;
    if out.len() != source.bytes().len() {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::SIZE_MISMATCH,
            cause: format!(
                "cannot copy {} bytes into a {} byte output",
                source.bytes().len(),
                out.len()
            ),
        });
    }
    out.copy_from_slice(source.bytes());
    Ok(())
}
