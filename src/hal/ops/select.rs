//! Element-wise ternary select: `where(condition, x, y)`.

use super::{OpError, OpKind, check_count};
use crate::{
    hal::{handler::Handler, key::WhereKey},
    loom::{
        device::Device,
        kernel::{Expr, KernelBody, KernelInput, KernelOutput, KernelProgram},
        tensor::Tensor,
    },
};

const OP: OpKind = OpKind::Where;

pub fn validate<D: Device>(inputs: &[Tensor<D>]) -> Result<(), OpError> {
    check_count(OP, inputs, 3..=3)?;
    let (x, y) = (inputs[1].data_type(), inputs[2].data_type());
    if x != y {
        let reason = format!("value types {x} and {y} mismatch");
        return Err(OpError::validation(OP, reason));
    }
    Ok(())
}

pub fn resolve<D: Device>(inputs: &[Tensor<D>]) -> Result<WhereKey, OpError> {
    Ok(WhereKey {
        r#type: inputs[1].data_type(),
        condition: inputs[0].dims(),
        x: inputs[1].dims(),
        y: inputs[2].dims(),
    })
}

pub fn program(key: &WhereKey) -> KernelProgram {
    KernelProgram {
        name: "Where".into(),
        inputs: vec![
            KernelInput::logical("C", key.condition.clone()),
            KernelInput::indexed("X", key.x.clone(), key.r#type),
            KernelInput::indexed("Y", key.y.clone(), key.r#type),
        ],
        output: KernelOutput {
            dims: key.condition.clone(),
            r#type: key.r#type,
        },
        body: KernelBody {
            remap: vec![],
            value: Expr::select(Expr::Read(0), Expr::Read(1), Expr::Read(2)),
        },
    }
}

/// Picks `inputs[1]` where `inputs[0]` is strictly positive, `inputs[2]` elsewhere.
/// The output takes the condition's dims.
pub fn select<D: Device>(
    handler: &Handler<D>,
    inputs: &[Tensor<D>],
) -> Result<Tensor<D>, OpError> {
    validate(inputs)?;
    let key = resolve(inputs)?;
    let factory = {
        let key = key.clone();
        move || program(&key)
    };
    handler.run(key.into(), factory, &[&inputs[0], &inputs[1], &inputs[2]])
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::select;
    use crate::{
        hal::{handler::Handler, ops::OpError},
        loom::{
            device::{Cpu, DeviceError},
            tensor::Tensor,
        },
    };

    #[test]
    fn test_select() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let c = Tensor::from_bools(&cpu, [2, 2], &[true, false, false, true])?;
        let x = Tensor::create(&cpu, [2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let y = Tensor::create(&cpu, [2, 2], &[-1.0f32, -2.0, -3.0, -4.0])?;
        let output = select(&handler, &[c, x.clone(), y.clone()])?;
        assert_eq!(output.dims().as_ref(), &[2, 2]);
        assert_eq!(output.back::<f32>()?.as_ref(), &[1.0, -2.0, -3.0, 4.0]);

        // a numeric condition goes through its boolean view, negatives read as false
        let c = Tensor::create(&cpu, [2, 2], &[-5i32, 0, 1, 9])?;
        let output = select(&handler, &[c, x, y])?;
        assert_eq!(output.back::<f32>()?.as_ref(), &[-1.0, -2.0, 3.0, 4.0]);

        Ok(())
    }

    #[test]
    fn test_select_mixed() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let c = Tensor::from_bools(&cpu, [3], &[true, false, true])?;
        let x = Tensor::create(&cpu, [3], &[10i32, 20, 30])?;
        let y = Tensor::create(&cpu, [3], &[1i32, 2, 3])?;
        let output = select(&handler, &[c, x, y])?;
        assert_eq!(output.dims().as_ref(), &[3]);
        assert_eq!(output.back::<i32>()?.as_ref(), &[10, 2, 30]);

        Ok(())
    }

    #[test]
    fn test_select_random() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let c: Vec<f32> = (0..64).map(|_| fastrand::f32() - 0.5).collect();
        let x: Vec<i32> = (0..64).map(|_| fastrand::i32(..)).collect();
        let y: Vec<i32> = (0..64).map(|_| fastrand::i32(..)).collect();
        let inputs = [
            Tensor::create(&cpu, [8, 8], &c)?,
            Tensor::create(&cpu, [8, 8], &x)?,
            Tensor::create(&cpu, [8, 8], &y)?,
        ];

        let output = select(&handler, &inputs)?.back::<i32>()?;
        for (index, &value) in output.iter().enumerate() {
            let expected = if c[index] > 0.0 { x[index] } else { y[index] };
            assert_eq!(value, expected);
        }

        // same shapes hit the same kernel
        select(&handler, &inputs)?;
        assert_eq!(handler.len(), 1);

        Ok(())
    }

    #[test]
    fn test_select_invalid() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let c = Tensor::from_bools(&cpu, [2], &[true, false])?;
        let x = Tensor::create(&cpu, [2], &[1.0f32, 2.0])?;
        let y = Tensor::create(&cpu, [2], &[1i32, 2])?;

        let err = select(&handler, &[c.clone(), x.clone(), y]);
        assert!(matches!(err, Err(OpError::Validation { .. })));

        let err = select(&handler, &[c.clone(), x.clone()]);
        assert!(matches!(err, Err(OpError::Validation { .. })));
        assert!(handler.is_empty());

        // a value operand smaller than the condition is caught by the program check
        let y = Tensor::create(&cpu, [1], &[1.0f32])?;
        let err = select(&handler, &[c, x, y]);
        assert!(matches!(
            err,
            Err(OpError::Device(DeviceError::Compile(_)))
        ));
        assert!(handler.is_empty());

        Ok(())
    }
}
