//! Elementwise f32 arithmetic.

use crate::codes;
use byteorder::{ByteOrder, LittleEndian};
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::tensor::{DataType, TensorDesc, TensorValue};
use hyflow_core::traits::TaskHandle;
use hyflow_core::types::NodeId;

/// Unary elementwise operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `|x|`
    Abs,
    /// `-x`
    Neg,
    /// `max(x, 0)`
    Relu,
}

impl UnaryOp {
    fn apply(self, x: f32) -> f32 {
        match self {
            Self::Abs => x.abs(),
            Self::Neg => -x,
            Self::Relu => x.max(0.0),
        }
    }
}

/// Binary elementwise operator on equally shaped tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a * b`
    Mul,
}

impl BinaryOp {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Mul => a * b,
        }
    }
}

fn read_f32(node: NodeId, tensor: &TensorValue) -> Result<Vec<f32>> {
    if tensor.desc().dtype != DataType::F32 {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::UNSUPPORTED_DTYPE,
            cause: format!("expected f32, got {:?}", tensor.desc().dtype),
        });
    }
    let bytes = tensor.bytes();
    if bytes.len() % 4 != 0 {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::SIZE_MISMATCH,
            cause: format!("{} bytes is not a whole number of f32", bytes.len()),
        });
    }
    let mut values = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut values);
    Ok(values)
}

fn write_f32(node: NodeId, handle: &mut TaskHandle, values: &[f32]) -> Result<()> {
    let out = handle.output_mut(0)?;
    if out.len() != values.len() * 4 {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::SIZE_MISMATCH,
            cause: format!("output holds {} bytes, result needs {}", out.len(), values.len() * 4),
        });
    }
    LittleEndian::write_f32_into(values, out);
    Ok(())
}

pub(crate) fn unary(op: UnaryOp, handle: &mut TaskHandle) -> Result<()> {
    let node = handle.node;
    let values: Vec<f32> = read_f32(node, handle.input(0)?)?
        .into_iter()
        .map(|x| op.apply(x))
        .collect();
    write_f32(node, handle, &values)
}

pub(crate) fn binary(op: BinaryOp, handle: &mut TaskHandle) -> Result<()> {
    let node = handle.node;
    let a = read_f32(node, handle.input(0)?)?;
    let b = read_f32(node, handle.input(1)?)?;
    if a.len() != b.len() {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::SHAPE_MISMATCH,
            cause: format!("operands have {} and {} elements", a.len(), b.len()),
        });
    }
    let values: Vec<f32> = a.iter().zip(&b).map(|(x, y)| op.apply(*x, *y)).collect();
    write_f32(node, handle, &values)
}

/// Output shape of an elementwise op: all inputs must agree.
pub(crate) fn elementwise_shape(node: NodeId, inputs: &[TensorDesc]) -> Result<TensorDesc> {
    let first = inputs.first().ok_or_else(|| HyflowError::ShapeInference {
        node,
        cause: "elementwise op without inputs".to_string(),
    })?;
    if let Some(other) = inputs.iter().find(|d| d.shape != first.shape) {
        return Err(HyflowError::ShapeInference {
            node,
            cause: format!("shapes {:?} and {:?} differ", first.shape, other.shape),
        });
    }
    Ok(first.clone())
}
