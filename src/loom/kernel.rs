//! Kernel programs: the per-output-element descriptions handed to a device for compilation.
//!
//! A [`KernelProgram`] computes one output element at a time. The output multi-index is first
//! rewritten by the [`IndexOp`]s of the body, then the body's [`Expr`] reads the inputs at that
//! index. Reads align the index to the input from the right: extra leading output axes are
//! dropped, missing leading input axes read index `0`.

use std::{borrow::Cow, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{num::DataType, tensor::element_count};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel {0}: read of undeclared input {1}")]
    Input(Cow<'static, str>, usize),
    #[error("kernel {0}: input {1} is declared but never read")]
    Unused(Cow<'static, str>, usize),
    #[error("kernel {0}: expected data type {1}, found {2}")]
    Type(Cow<'static, str>, DataType, DataType),
    #[error("kernel {0}: logical input {1} must be declared as Bool")]
    Logical(Cow<'static, str>, usize),
    #[error("kernel {0}: remap axis {1} is out of output rank {2}")]
    Axis(Cow<'static, str>, usize, usize),
    #[error("kernel {0}: read of input {1} spans {2}..={3} on axis {4} of size {5}")]
    Bounds(Cow<'static, str>, usize, i64, i64, usize, usize),
}

/// How a kernel reads one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    /// Direct indexed lookup in the input's native storage.
    Indexed,
    /// Indexed lookup in a boolean view of the input, which must be bound as [`DataType::Bool`].
    Logical,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelInput {
    pub name: Cow<'static, str>,
    pub dims: Arc<[usize]>,
    pub r#type: DataType,
    pub access: Access,
}

impl KernelInput {
    #[inline]
    pub fn indexed(
        name: impl Into<Cow<'static, str>>,
        dims: impl Into<Arc<[usize]>>,
        r#type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            dims: dims.into(),
            r#type,
            access: Access::Indexed,
        }
    }

    #[inline]
    pub fn logical(name: impl Into<Cow<'static, str>>, dims: impl Into<Arc<[usize]>>) -> Self {
        Self {
            name: name.into(),
            dims: dims.into(),
            r#type: DataType::Bool,
            access: Access::Logical,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        element_count(&self.dims)
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.count() * self.r#type.size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelOutput {
    pub dims: Arc<[usize]>,
    pub r#type: DataType,
}

impl KernelOutput {
    #[inline]
    pub fn count(&self) -> usize {
        element_count(&self.dims)
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.count() * self.r#type.size()
    }
}

/// One rewrite step applied to the output multi-index before any input is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IndexOp {
    /// `index[axis] = 0`.
    #[display("i{axis} = 0")]
    Reset { axis: usize },
    /// `index[axis] += offset`.
    #[display("i{axis} += {offset}")]
    Offset { axis: usize, offset: usize },
    /// `index[axis] = len - index[axis] - 1`.
    #[display("i{axis} = {len} - i{axis} - 1")]
    Reverse { axis: usize, len: usize },
}

impl IndexOp {
    #[inline]
    pub fn axis(&self) -> usize {
        match *self {
            IndexOp::Reset { axis } => axis,
            IndexOp::Offset { axis, .. } => axis,
            IndexOp::Reverse { axis, .. } => axis,
        }
    }

    /// Rewrites one multi-index in place.
    #[inline]
    pub fn apply(&self, index: &mut [i64]) {
        match *self {
            IndexOp::Reset { axis } => index[axis] = 0,
            IndexOp::Offset { axis, offset } => index[axis] += offset as i64,
            IndexOp::Reverse { axis, len } => index[axis] = len as i64 - index[axis] - 1,
        }
    }

    /// Rewrites the inclusive per-axis bounds of all indices in place.
    #[inline]
    fn apply_bounds(&self, bounds: &mut [(i64, i64)]) {
        match *self {
            IndexOp::Reset { axis } => bounds[axis] = (0, 0),
            IndexOp::Offset { axis, offset } => {
                let (lo, hi) = bounds[axis];
                bounds[axis] = (lo + offset as i64, hi + offset as i64);
            }
            IndexOp::Reverse { axis, len } => {
                let (lo, hi) = bounds[axis];
                let len = len as i64;
                bounds[axis] = (len - hi - 1, len - lo - 1);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Expr {
    /// Reads the input at the given position of the input list.
    #[display("_{_0}[i]")]
    Read(usize),
    /// Picks `x` if `cond` is true, `y` otherwise. `cond` must be of [`DataType::Bool`].
    #[display("{cond} ? {x} : {y}")]
    Select {
        cond: Box<Expr>,
        x: Box<Expr>,
        y: Box<Expr>,
    },
    /// `true` if the value is strictly positive.
    #[display("({_0} > 0)")]
    Logical(Box<Expr>),
}

impl Expr {
    #[inline]
    pub fn select(cond: Expr, x: Expr, y: Expr) -> Self {
        let cond = Box::new(cond);
        let x = Box::new(x);
        let y = Box::new(y);
        Self::Select { cond, x, y }
    }

    /// Collects every input read by the expression, in reading order.
    pub fn reads(&self) -> Vec<usize> {
        match self {
            Expr::Read(input) => vec![*input],
            Expr::Select { cond, x, y } => [cond, x, y].iter().flat_map(|x| x.reads()).collect(),
            Expr::Logical(x) => x.reads(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelBody {
    pub remap: Vec<IndexOp>,
    pub value: Expr,
}

impl std::fmt::Display for KernelBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for op in &self.remap {
            write!(f, "{op}; ")?;
        }
        write!(f, "return {}", self.value)
    }
}

/// Everything a device needs to build a kernel that computes one output tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelProgram {
    pub name: Cow<'static, str>,
    pub inputs: Vec<KernelInput>,
    pub output: KernelOutput,
    pub body: KernelBody,
}

impl KernelProgram {
    /// Infers the data type of an expression.
    pub fn type_of(&self, expr: &Expr) -> Result<DataType, KernelError> {
        match expr {
            Expr::Read(input) => match self.inputs.get(*input) {
                Some(input) => Ok(input.r#type),
                None => Err(KernelError::Input(self.name.clone(), *input)),
            },
            Expr::Select { cond, x, y } => {
                let cond = self.type_of(cond)?;
                if cond != DataType::Bool {
                    return Err(KernelError::Type(self.name.clone(), DataType::Bool, cond));
                }
                let (x, y) = (self.type_of(x)?, self.type_of(y)?);
                if x != y {
                    return Err(KernelError::Type(self.name.clone(), x, y));
                }
                Ok(x)
            }
            Expr::Logical(x) => self.type_of(x).map(|_| DataType::Bool),
        }
    }

    /// Inclusive per-axis bounds of the output multi-index after the remap steps.
    fn bounds(&self) -> Vec<(i64, i64)> {
        let mut bounds = self
            .output
            .dims
            .iter()
            .map(|&dim| (0, dim as i64 - 1))
            .collect_vec();
        for op in &self.body.remap {
            op.apply_bounds(&mut bounds);
        }
        bounds
    }

    /// Checks that the program is well-formed. Devices run this before compiling.
    ///
    /// 1. Every read refers to a declared input, and every declared input is read.
    /// 2. Logical inputs are declared as [`DataType::Bool`].
    /// 3. The body's type matches the output type.
    /// 4. Every remap step refers to an output axis.
    /// 5. No read can leave the bounds of its input.
    pub fn check(&self) -> Result<(), KernelError> {
        let name = || self.name.clone();

        let reads = self.body.value.reads();
        if let Some(&input) = reads.iter().find(|&&input| input >= self.inputs.len()) {
            return Err(KernelError::Input(name(), input));
        }
        if let Some(input) = (0..self.inputs.len()).find(|input| !reads.contains(input)) {
            return Err(KernelError::Unused(name(), input));
        }

        for (index, input) in self.inputs.iter().enumerate() {
            if input.access == Access::Logical && input.r#type != DataType::Bool {
                return Err(KernelError::Logical(name(), index));
            }
        }

        let r#type = self.type_of(&self.body.value)?;
        if r#type != self.output.r#type {
            return Err(KernelError::Type(name(), self.output.r#type, r#type));
        }

        let rank = self.output.dims.len();
        if let Some(op) = self.body.remap.iter().find(|op| op.axis() >= rank) {
            return Err(KernelError::Axis(name(), op.axis(), rank));
        }

        // an empty output never reads anything
        if self.output.count() == 0 {
            return Ok(());
        }

        let bounds = self.bounds();
        for input in reads.into_iter().unique() {
            let dims = &self.inputs[input].dims;
            for (axis, &dim) in dims.iter().enumerate() {
                let (lo, hi) = match (rank + axis).checked_sub(dims.len()) {
                    Some(axis) => bounds[axis],
                    None => (0, 0),
                };
                if lo < 0 || hi >= dim as i64 {
                    return Err(KernelError::Bounds(name(), input, lo, hi, axis, dim));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for KernelProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs = self
            .inputs
            .iter()
            .map(|x| format!("{}: {}[{}]", x.name, x.r#type, x.dims.iter().format(", ")))
            .join(", ");
        let output = &self.output;
        write!(
            f,
            "{}({inputs}) -> {}[{}] {{ {} }}",
            self.name,
            output.r#type,
            output.dims.iter().format(", "),
            self.body
        )
    }
}

/// Row-major multi-index of the `flat`-th element of `dims`.
#[inline]
pub fn unravel(mut flat: usize, dims: &[usize], index: &mut [i64]) {
    for (x, &dim) in index.iter_mut().zip(dims).rev() {
        *x = (flat % dim) as i64;
        flat /= dim;
    }
}

/// Row-major flat offset of `index` into an input of `dims`, aligning both from the right.
/// Returns `None` if the index is out of bounds.
pub fn locate(index: &[i64], dims: &[usize]) -> Option<usize> {
    let skip = index.len().saturating_sub(dims.len());
    let pad = dims.len().saturating_sub(index.len());
    let index = std::iter::repeat_n(0, pad).chain(index[skip..].iter().copied());

    let mut offset = 0;
    for (x, &dim) in index.zip_eq(dims) {
        let x = usize::try_from(x).ok().filter(|&x| x < dim)?;
        offset = offset * dim + x;
    }
    Some(offset)
}

/// Row-major strides of `dims`.
pub fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}
