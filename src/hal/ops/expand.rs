//! Broadcast a tensor to a requested shape.

use std::sync::Arc;

use itertools::Itertools;

use super::{OpError, OpKind, check_count, check_index, index_data};
use crate::{
    hal::{handler::Handler, key::ExpandKey},
    loom::{
        device::Device,
        kernel::{Expr, IndexOp, KernelBody, KernelInput, KernelOutput, KernelProgram},
        tensor::{Tensor, checked_data_size},
    },
};

const OP: OpKind = OpKind::Expand;

pub fn validate<D: Device>(inputs: &[Tensor<D>]) -> Result<(), OpError> {
    check_count(OP, inputs, 2..=2)?;
    check_index(OP, "shape", &inputs[1], |x| x.is_integer())
}

/// Left-pads `dims` with 1s up to `rank`.
fn pad(dims: &[usize], rank: usize) -> impl Iterator<Item = usize> + '_ {
    std::iter::repeat_n(1, rank - dims.len()).chain(dims.iter().copied())
}

/// Broadcast output dims of `input` against the requested `shape`, aligned from the right.
/// Every axis takes the larger of the two sizes.
pub fn output_dims(input: &[usize], shape: &[usize]) -> Vec<usize> {
    let rank = input.len().max(shape.len());
    pad(input, rank)
        .zip(pad(shape, rank))
        .map(|(x, y)| x.max(y))
        .collect()
}

pub fn resolve<D: Device>(inputs: &[Tensor<D>]) -> Result<ExpandKey, OpError> {
    let data = &inputs[0];
    let shape = index_data(&inputs[1])?
        .into_iter()
        .map(|x| {
            usize::try_from(x).map_err(|_| OpError::validation(OP, format!("negative dim {x}")))
        })
        .collect::<Result<Arc<[usize]>, _>>()?;

    let input = data.dims();
    let dims = output_dims(&input, &shape);

    // an axis grows only from size 1
    let skip = dims.len() - input.len();
    if input.iter().zip(&dims[skip..]).any(|(&x, &y)| x != 1 && x != y) {
        let reason = format!(
            "cannot broadcast [{}] to [{}]",
            input.iter().format(", "),
            shape.iter().format(", ")
        );
        return Err(OpError::validation(OP, reason));
    }

    let r#type = data.data_type();
    if checked_data_size(&dims, r#type).is_none() {
        let reason = format!("output [{}] is too large", dims.iter().format(", "));
        return Err(OpError::validation(OP, reason));
    }

    Ok(ExpandKey {
        r#type,
        input,
        shape,
    })
}

pub fn program(key: &ExpandKey) -> KernelProgram {
    let dims = output_dims(&key.input, &key.shape);
    let rank = dims.len();
    // leading axes the input does not have are never read
    let skip = rank.saturating_sub(key.input.len());
    let remap = key
        .input
        .iter()
        .zip(&dims[skip..])
        .enumerate()
        .filter(|&(_, (&input, &output))| input == 1 && output != 1)
        .map(|(axis, _)| IndexOp::Reset { axis: skip + axis })
        .collect();

    KernelProgram {
        name: "Expand".into(),
        inputs: vec![KernelInput::indexed("X", key.input.clone(), key.r#type)],
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

/// Broadcasts `inputs[0]` to the shape held by `inputs[1]`.
pub fn expand<D: Device>(
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

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{expand, output_dims, program, resolve};
    use crate::{
        hal::{handler::Handler, ops::OpError},
        loom::{device::Cpu, kernel::IndexOp, tensor::Tensor},
    };

    #[test]
    fn test_output_dims() {
        assert_eq!(output_dims(&[3, 1], &[2, 1, 4]), vec![2, 3, 4]);
        assert_eq!(output_dims(&[2, 3, 4], &[4]), vec![2, 3, 4]);
        assert_eq!(output_dims(&[3, 1], &[0]), vec![3, 1]);
        assert_eq!(output_dims(&[3], &[2]), vec![3]);
        assert_eq!(output_dims(&[], &[2, 2]), vec![2, 2]);
    }

    #[test]
    fn test_expand() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let x = Tensor::create(&cpu, [3, 1], &[1.0f32, 2.0, 3.0])?;
        let shape = Tensor::initializer(&cpu, [3], &[2i64, 1, 4])?;
        let inputs = [x, shape];

        let key = resolve(&inputs)?;
        let program = program(&key);
        assert_eq!(program.output.dims.as_ref(), &[2, 3, 4]);
        assert_eq!(program.body.remap, [IndexOp::Reset { axis: 2 }]);

        let output = expand(&handler, &inputs)?;
        assert_eq!(output.dims().as_ref(), &[2, 3, 4]);
        let output = output.back::<f32>()?;
        for (index, &value) in output.iter().enumerate() {
            // row is the middle axis
            let row = (index / 4) % 3;
            assert_eq!(value, (row + 1) as f32);
        }

        Ok(())
    }

    #[test]
    fn test_expand_scalar() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let x = Tensor::create(&cpu, [0usize; 0], &[7i32])?;
        let shape = Tensor::create(&cpu, [2], &[2i32, 2])?;
        let output = expand(&handler, &[x, shape])?;
        assert_eq!(output.dims().as_ref(), &[2, 2]);
        assert_eq!(output.back::<i32>()?.as_ref(), &[7, 7, 7, 7]);

        Ok(())
    }

    #[test]
    fn test_expand_invalid() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);
        let x = Tensor::create(&cpu, [3], &[1.0f32, 2.0, 3.0])?;

        let shape = Tensor::create(&cpu, [1], &[-2i64])?;
        let err = expand(&handler, &[x.clone(), shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let shape = Tensor::create(&cpu, [1], &[2.0f32])?;
        let err = expand(&handler, &[x.clone(), shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let shape = Tensor::create(&cpu, [1, 1], &[3i64])?;
        let err = expand(&handler, &[x.clone(), shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let err = expand(&handler, &[x.clone()]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        // a non-1 axis cannot grow
        let shape = Tensor::create(&cpu, [1], &[5i64])?;
        let err = expand(&handler, &[x.clone(), shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let empty = Tensor::create::<f32>(&cpu, [0], &[])?;
        let shape = Tensor::create(&cpu, [1], &[2i64])?;
        let err = expand(&handler, &[empty, shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let one = Tensor::create(&cpu, [1], &[1.0f32])?;
        let shape = Tensor::create(&cpu, [3], &[1i64 << 30, 1 << 30, 1 << 30])?;
        let err = expand(&handler, &[one, shape]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        assert!(handler.is_empty());
        Ok(())
    }

    #[test]
    fn test_expand_keeps_larger() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let x = Tensor::create(&cpu, [5], &[1.0f32, 2.0, 3.0, 4.0, 5.0])?;
        let shape = Tensor::initializer(&cpu, [1], &[2i64])?;
        let output = expand(&handler, &[x, shape])?;
        assert_eq!(output.dims().as_ref(), &[5]);
        assert_eq!(output.back::<f32>()?.as_ref(), &[1.0, 2.0, 3.0, 4.0, 5.0]);

        // a requested 0 never shrinks a size-1 axis
        let x = Tensor::create(&cpu, [3, 1], &[1i32, 2, 3])?;
        let shape = Tensor::initializer(&cpu, [1], &[0i64])?;
        let output = expand(&handler, &[x, shape])?;
        assert_eq!(output.dims().as_ref(), &[3, 1]);
        assert_eq!(output.back::<i32>()?.as_ref(), &[1, 2, 3]);

        let x = Tensor::create(&cpu, [3, 1], &[1.0f32, 2.0, 3.0])?;
        let shape = Tensor::initializer(&cpu, [2], &[3i64, 4])?;
        let output = expand(&handler, &[x, shape])?.back::<f32>()?;
        for (index, &value) in output.iter().enumerate() {
            assert_eq!(value, (index / 4 + 1) as f32);
        }

        Ok(())
    }
}
