//! Multi-axis slicing with unit forward or reverse steps.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{OpError, OpKind, check_count, check_index, index_data};
use crate::{
    hal::{
        handler::Handler,
        key::{Bound, SliceKey},
    },
    loom::{
        device::Device,
        kernel::{Expr, IndexOp, KernelBody, KernelInput, KernelOutput, KernelProgram},
        num::DataType,
        tensor::Tensor,
    },
};

const OP: OpKind = OpKind::Slice;

/// Slice attributes taken from the node. Empty `axes` means all axes in order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SliceAttributes {
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
    pub axes: Vec<i64>,
}

fn check_data<D: Device>(data: &Tensor<D>) -> Result<(), OpError> {
    match data.data_type().is_number() {
        true => Ok(()),
        false => {
            let reason = format!("invalid data type {}", data.data_type());
            Err(OpError::validation(OP, reason))
        }
    }
}

/// Validates the attribute form: a single numeric data input.
pub fn validate<D: Device>(inputs: &[Tensor<D>]) -> Result<(), OpError> {
    check_count(OP, inputs, 1..=1)?;
    check_data(&inputs[0])
}

/// Validates the input form: data, starts, ends, and optional axes and steps.
pub fn validate_v10<D: Device>(inputs: &[Tensor<D>]) -> Result<(), OpError> {
    check_count(OP, inputs, 3..=5)?;
    check_data(&inputs[0])?;
    let roles = ["starts", "ends", "axes", "steps"];
    for (role, tensor) in roles.into_iter().zip(&inputs[1..]) {
        check_index(OP, role, tensor, |x| {
            matches!(x, DataType::I32 | DataType::I64)
        })?;
    }
    Ok(())
}

/// Clamps a forward start or end into `0..=size`.
fn normalize_forward(value: i64, size: i64) -> i64 {
    match value {
        x if x > size - 1 => size,
        x if x < 0 => (x + size).max(0),
        x => x,
    }
}

/// Normalizes attributes against `dims` and builds the key.
fn normalize(
    dims: &[usize],
    r#type: DataType,
    axes: &[i64],
    starts: &[i64],
    ends: &[i64],
    reverse: bool,
    bound: Bound,
) -> Result<SliceKey, OpError> {
    let rank = dims.len();
    if starts.len() != ends.len() {
        let reason = format!("{} starts but {} ends", starts.len(), ends.len());
        return Err(OpError::validation(OP, reason));
    }

    let axes: Vec<usize> = match axes.is_empty() {
        true => (0..rank.min(starts.len())).collect(),
        false => {
            if axes.len() != starts.len() {
                let reason = format!("{} axes but {} starts", axes.len(), starts.len());
                return Err(OpError::validation(OP, reason));
            }
            let mut normalized = Vec::with_capacity(axes.len());
            for &axis in axes {
                let x = if axis < 0 { axis + rank as i64 } else { axis };
                let Some(x) = usize::try_from(x).ok().filter(|&x| x < rank) else {
                    let reason = format!("axis {axis} out of rank {rank}");
                    return Err(OpError::validation(OP, reason));
                };
                if normalized.contains(&x) {
                    return Err(OpError::validation(OP, format!("repeated axis {axis}")));
                }
                normalized.push(x);
            }
            normalized
        }
    };
    if axes.len() != starts.len() {
        let reason = format!("{} starts for rank {rank}", starts.len());
        return Err(OpError::validation(OP, reason));
    }

    let mut normalized_starts = Vec::with_capacity(axes.len());
    let mut normalized_ends = Vec::with_capacity(axes.len());
    for ((&axis, &start), &end) in axes.iter().zip(starts).zip(ends) {
        let size = dims[axis] as i64;
        let (start, end) = match reverse {
            false => (normalize_forward(start, size), normalize_forward(end, size)),
            true => {
                let start = if start < 0 { start + size } else { start };
                let end = if end < 0 { end + size } else { end };
                (start.min(size - 1).max(0), end.min(size).max(-1))
            }
        };
        normalized_starts.push(start);
        normalized_ends.push(end);
    }

    Ok(SliceKey {
        r#type,
        dims: dims.into(),
        axes,
        starts: normalized_starts,
        ends: normalized_ends,
        reverse,
        bound,
    })
}

/// Resolves the attribute form. Ends are always static.
pub fn resolve<D: Device>(
    inputs: &[Tensor<D>],
    attributes: &SliceAttributes,
) -> Result<SliceKey, OpError> {
    let data = &inputs[0];
    normalize(
        &data.dims(),
        data.data_type(),
        &attributes.axes,
        &attributes.starts,
        &attributes.ends,
        false,
        Bound::Static,
    )
}

/// Resolves the input form. Starts, axes and steps must be initializers. Ends read from a runtime
/// tensor are resolved from its current contents and tagged [`Bound::Runtime`].
pub fn resolve_v10<D: Device>(inputs: &[Tensor<D>]) -> Result<SliceKey, OpError> {
    let data = &inputs[0];
    let dynamic = |role: &str| OpError::unsupported(OP, format!("dynamic {role}"));

    if !inputs[1].is_initializer() {
        return Err(dynamic("starts"));
    }
    if inputs.get(3).is_some_and(|x| !x.is_initializer()) {
        return Err(dynamic("axes"));
    }
    if inputs.get(4).is_some_and(|x| !x.is_initializer()) {
        return Err(dynamic("steps"));
    }

    let starts = index_data(&inputs[1])?;
    let ends = index_data(&inputs[2])?;
    let axes = match inputs.get(3) {
        Some(axes) => index_data(axes)?,
        None => vec![],
    };

    let reverse = match inputs.get(4) {
        Some(steps) => {
            let steps = index_data(steps)?;
            if let Some(step) = steps.iter().find(|&&x| x != 1 && x != -1) {
                return Err(OpError::unsupported(OP, format!("step {step}")));
            }
            if steps.len() != starts.len() {
                let reason = format!("{} steps but {} starts", steps.len(), starts.len());
                return Err(OpError::validation(OP, reason));
            }
            let reverse = steps.iter().any(|&x| x == -1);
            if reverse && steps.iter().any(|&x| x == 1) {
                return Err(OpError::validation(OP, "mixed step signs"));
            }
            reverse
        }
        None => false,
    };

    let bound = match inputs[2].is_initializer() {
        true => Bound::Static,
        false => Bound::Runtime,
    };
    normalize(
        &data.dims(),
        data.data_type(),
        &axes,
        &starts,
        &ends,
        reverse,
        bound,
    )
}

pub fn program(key: &SliceKey) -> KernelProgram {
    let mut dims = key.dims.to_vec();
    let mut remap = vec![];
    for ((&axis, &start), &end) in key.axes.iter().zip(&key.starts).zip(&key.ends) {
        let size = key.dims[axis] as i64;
        if !key.reverse {
            dims[axis] = (end - start).max(0) as usize;
            if start > 0 {
                let offset = start as usize;
                remap.push(IndexOp::Offset { axis, offset });
            }
            continue;
        }

        if size == 0 {
            dims[axis] = 0;
            continue;
        }
        // the walk covers `low..=high`, visited from `high` down
        let (low, len) = match start > end {
            true => (end + 1, start - end),
            false => (start, end - start),
        };
        dims[axis] = len as usize;
        if len > 0 {
            let len = len as usize;
            remap.push(IndexOp::Reverse { axis, len });
        }
        if low > 0 {
            let offset = low as usize;
            remap.push(IndexOp::Offset { axis, offset });
        }
    }

    KernelProgram {
        name: "Slice".into(),
        inputs: vec![KernelInput::indexed("A", key.dims.clone(), key.r#type)],
        output: KernelOutput {
            dims: dims.into(),
            r#type: key.r#type,
        },
        body: KernelBody {
            remap,
            value: Expr::Read(0),
        },
    }
}

fn run<D: Device>(
    handler: &Handler<D>,
    data: &Tensor<D>,
    key: SliceKey,
) -> Result<Tensor<D>, OpError> {
    let factory = {
        let key = key.clone();
        move || program(&key)
    };
    handler.run(key.into(), factory, &[data])
}

/// Slices `inputs[0]` with starts, ends and axes from node attributes.
pub fn slice<D: Device>(
    handler: &Handler<D>,
    inputs: &[Tensor<D>],
    attributes: &SliceAttributes,
) -> Result<Tensor<D>, OpError> {
    validate(inputs)?;
    let key = resolve(inputs, attributes)?;
    run(handler, &inputs[0], key)
}

/// Slices `inputs[0]` with starts, ends, axes and steps from `inputs[1..]`.
pub fn slice_v10<D: Device>(
    handler: &Handler<D>,
    inputs: &[Tensor<D>],
) -> Result<Tensor<D>, OpError> {
    validate_v10(inputs)?;
    let key = resolve_v10(inputs)?;
    run(handler, &inputs[0], key)
}
