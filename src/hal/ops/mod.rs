//! Operators. Each validates its inputs, resolves its attributes into a [`CacheKey`], and hands
//! a kernel program generator to the [`Handler`].

use std::ops::RangeInclusive;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use slice::SliceAttributes;

use super::{handler::Handler, key::CacheKey};
use crate::loom::{
    device::{Device, DeviceError},
    num::DataType,
    tensor::{Tensor, TensorError},
};

pub mod argmax;
pub mod expand;
pub mod select;
pub mod slice;

/// The identity of an operator, without its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpKind {
    Expand,
    Slice,
    Where,
    ArgMax,
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error("{op}: {reason}")]
    Validation { op: OpKind, reason: String },
    #[error("{op}: {feature} is not supported")]
    Unsupported { op: OpKind, feature: String },
    #[error("kernel expects {0} inputs, {1} given")]
    Arity(usize, usize),
    #[error("input {index} ({name}) expects {expected}, found {found}")]
    Binding {
        index: usize,
        name: String,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl OpError {
    #[inline]
    pub fn validation(op: OpKind, reason: impl ToString) -> Self {
        let reason = reason.to_string();
        Self::Validation { op, reason }
    }

    #[inline]
    pub fn unsupported(op: OpKind, feature: impl ToString) -> Self {
        let feature = feature.to_string();
        Self::Unsupported { op, feature }
    }

    /// Returns `true` if the request is well-formed but outside the supported subset.
    #[inline]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, OpError::Unsupported { .. })
    }

    /// Returns `true` if the request itself is malformed.
    #[inline]
    pub fn is_validation(&self) -> bool {
        matches!(self, OpError::Validation { .. })
    }
}

/// A graph node's operator with its resolved attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operator {
    Expand,
    /// Slice with starts, ends and axes taken from node attributes.
    Slice(SliceAttributes),
    /// Slice with starts, ends, axes and steps taken from input tensors.
    SliceV10,
    Where,
    ArgMax,
}

impl Operator {
    #[inline]
    pub fn kind(&self) -> OpKind {
        match self {
            Operator::Expand => OpKind::Expand,
            Operator::Slice(_) | Operator::SliceV10 => OpKind::Slice,
            Operator::Where => OpKind::Where,
            Operator::ArgMax => OpKind::ArgMax,
        }
    }

    /// Checks input count and element types without touching any shape.
    pub fn validate<D: Device>(&self, inputs: &[Tensor<D>]) -> Result<(), OpError> {
        match self {
            Operator::Expand => expand::validate(inputs),
            Operator::Slice(_) => slice::validate(inputs),
            Operator::SliceV10 => slice::validate_v10(inputs),
            Operator::Where => select::validate(inputs),
            Operator::ArgMax => argmax::validate(inputs),
        }
    }

    /// Resolves the cache key for the inputs, without compiling or running anything.
    pub fn resolve<D: Device>(&self, inputs: &[Tensor<D>]) -> Result<CacheKey, OpError> {
        self.validate(inputs)?;
        let key = match self {
            Operator::Expand => expand::resolve(inputs)?.into(),
            Operator::Slice(attributes) => slice::resolve(inputs, attributes)?.into(),
            Operator::SliceV10 => slice::resolve_v10(inputs)?.into(),
            Operator::Where => select::resolve(inputs)?.into(),
            Operator::ArgMax => argmax::resolve(inputs)?.into(),
        };
        Ok(key)
    }

    /// Runs the operator on the handler's device and returns its single output.
    pub fn run<D: Device>(
        &self,
        handler: &Handler<D>,
        inputs: &[Tensor<D>],
    ) -> Result<Tensor<D>, OpError> {
        match self {
            Operator::Expand => expand::expand(handler, inputs),
            Operator::Slice(attributes) => slice::slice(handler, inputs, attributes),
            Operator::SliceV10 => slice::slice_v10(handler, inputs),
            Operator::Where => select::select(handler, inputs),
            Operator::ArgMax => argmax::argmax(handler, inputs),
        }
    }
}

fn check_count<D: Device>(
    op: OpKind,
    inputs: &[Tensor<D>],
    count: RangeInclusive<usize>,
) -> Result<(), OpError> {
    if count.contains(&inputs.len()) {
        return Ok(());
    }
    let reason = match count.start() == count.end() {
        true => format!("expects {} inputs, found {}", count.start(), inputs.len()),
        false => format!(
            "expects {} to {} inputs, found {}",
            count.start(),
            count.end(),
            inputs.len()
        ),
    };
    Err(OpError::validation(op, reason))
}

/// Checks that an index-carrying input is rank 1 and of an accepted type.
fn check_index<D: Device>(
    op: OpKind,
    role: &str,
    tensor: &Tensor<D>,
    accept: impl Fn(DataType) -> bool,
) -> Result<(), OpError> {
    if !accept(tensor.data_type()) {
        let reason = format!("{role} has invalid data type {}", tensor.data_type());
        return Err(OpError::validation(op, reason));
    }
    if tensor.rank() != 1 {
        let reason = format!("{role} must be of rank 1, found rank {}", tensor.rank());
        return Err(OpError::validation(op, reason));
    }
    Ok(())
}

/// Reads the values of an index-carrying input.
fn index_data<D: Device>(tensor: &Tensor<D>) -> Result<Vec<i64>, OpError> {
    Ok(tensor.integer_data()?.to_vec())
}
