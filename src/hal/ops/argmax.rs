//! Index of the maximum, in its degenerate scalar form only.

use super::{OpError, OpKind, check_count, check_index, index_data};
use crate::{
    hal::{handler::Handler, key::ArgMaxKey},
    loom::{
        device::Device,
        kernel::{Expr, KernelBody, KernelInput, KernelOutput, KernelProgram},
        tensor::Tensor,
    },
};

const OP: OpKind = OpKind::ArgMax;

pub fn validate<D: Device>(inputs: &[Tensor<D>]) -> Result<(), OpError> {
    check_count(OP, inputs, 2..=2)?;
    check_index(OP, "shape", &inputs[1], |x| x.is_integer())?;
    if inputs[0].is_empty() {
        return Err(OpError::validation(OP, "empty data"));
    }
    Ok(())
}

pub fn resolve<D: Device>(inputs: &[Tensor<D>]) -> Result<ArgMaxKey, OpError> {
    let shape = index_data(&inputs[1])?;
    if !shape.is_empty() {
        return Err(OpError::unsupported(OP, "reduction to a non-scalar shape"));
    }
    let data = &inputs[0];
    Ok(ArgMaxKey {
        r#type: data.data_type(),
        dims: data.dims(),
    })
}

// TODO: reduce along the requested axes once non-scalar shapes are supported.
pub fn program(key: &ArgMaxKey) -> KernelProgram {
    KernelProgram {
        name: "ArgMax".into(),
        inputs: vec![KernelInput::indexed("X", key.dims.clone(), key.r#type)],
        output: KernelOutput {
            dims: [0usize; 0].into(),
            r#type: key.r#type,
        },
        body: KernelBody {
            remap: vec![],
            value: Expr::Read(0),
        },
    }
}

/// Reduces `inputs[0]` to a scalar holding its first element. The requested shape in `inputs[1]`
/// must be empty.
pub fn argmax<D: Device>(
    handler: &Handler<D>,
    inputs: &[Tensor<D>],
) -> Result<Tensor<D>, OpError> {
    validate(inputs)?;
    let key = resolve(inputs)?;
    let factory = {
        let key = key.clone();
        move || program(&key)
    };
    handler.run(key.into(), factory, &[&inputs[0]])
}
