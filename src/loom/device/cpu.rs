use std::sync::Arc;

use itertools::Itertools;

use super::{Device, DeviceError};
use crate::loom::{
    kernel::{self, Expr, KernelProgram},
    num::DataType,
};

/// Reference device keeping buffers in host memory and interpreting kernel programs per element.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cpu;

/// A checked program, ready to be interpreted.
#[derive(Debug, Clone)]
pub struct CpuKernel {
    program: KernelProgram,
}

impl CpuKernel {
    #[inline]
    pub fn program(&self) -> &KernelProgram {
        &self.program
    }

    /// Evaluates `expr` at the (remapped) output `index`, appending the element bytes to `output`.
    fn eval(
        &self,
        expr: &Expr,
        index: &[i64],
        inputs: &[&Arc<[u8]>],
        output: &mut Vec<u8>,
    ) -> Result<(), DeviceError> {
        match expr {
            Expr::Read(input) => {
                let decl = &self.program.inputs[*input];
                let size = decl.r#type.size();
                let data = kernel::locate(index, &decl.dims)
                    .and_then(|offset| inputs[*input].get(offset * size..(offset + 1) * size))
                    .ok_or_else(|| {
                        let index = index.iter().format(", ");
                        DeviceError::Execute(format!("read of input {input} out of bounds: [{index}]"))
                    })?;
                output.extend_from_slice(data);
            }
            Expr::Select { cond, x, y } => {
                let mut flag = Vec::with_capacity(1);
                self.eval(cond, index, inputs, &mut flag)?;
                match DataType::Bool.is_positive(&flag) {
                    true => self.eval(x, index, inputs, output)?,
                    false => self.eval(y, index, inputs, output)?,
                }
            }
            Expr::Logical(x) => {
                let r#type = self.program.type_of(x)?;
                let mut value = Vec::with_capacity(r#type.size());
                self.eval(x, index, inputs, &mut value)?;
                output.push(r#type.is_positive(&value) as u8);
            }
        }
        Ok(())
    }
}

impl Device for Cpu {
    type Buffer = Arc<[u8]>;
    type Kernel = CpuKernel;

    #[inline]
    fn upload(&self, _type: DataType, contents: &[u8]) -> Result<Self::Buffer, DeviceError> {
        Ok(contents.into())
    }

    #[inline]
    fn read(&self, _type: DataType, buffer: &Self::Buffer) -> Result<Box<[u8]>, DeviceError> {
        Ok(buffer.to_vec().into_boxed_slice())
    }

    #[inline]
    fn size(&self, buffer: &Self::Buffer) -> usize {
        buffer.len()
    }

    fn compile(&self, program: &KernelProgram) -> Result<Self::Kernel, DeviceError> {
        program.check()?;
        let program = program.clone();
        Ok(CpuKernel { program })
    }

    fn execute(
        &self,
        kernel: &Self::Kernel,
        inputs: &[&Self::Buffer],
    ) -> Result<Self::Buffer, DeviceError> {
        let program = &kernel.program;
        if inputs.len() != program.inputs.len() {
            return Err(DeviceError::Arity(program.inputs.len(), inputs.len()));
        }
        for (index, (decl, buffer)) in program.inputs.iter().zip(inputs).enumerate() {
            if buffer.len() != decl.data_size() {
                return Err(DeviceError::Size(index, decl.data_size(), buffer.len()));
            }
        }

        let dims = &program.output.dims;
        let mut output = Vec::with_capacity(program.output.data_size());
        let mut index = vec![0; dims.len()];
        for flat in 0..program.output.count() {
            kernel::unravel(flat, dims, &mut index);
            for op in &program.body.remap {
                op.apply(&mut index);
            }
            kernel.eval(&program.body.value, &index, inputs, &mut output)?;
        }
        Ok(output.into())
    }

    fn logical(
        &self,
        r#type: DataType,
        buffer: &Self::Buffer,
    ) -> Result<Self::Buffer, DeviceError> {
        let output = buffer
            .chunks_exact(r#type.size())
            .map(|x| r#type.is_positive(x) as u8)
            .collect();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Cpu;
    use crate::loom::{
        device::{Device, DeviceError},
        kernel::{Expr, IndexOp, KernelBody, KernelInput, KernelOutput, KernelProgram},
        num::DataType,
    };

    #[test]
    fn test_execute() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;

        // reverse the rows of a [2, 3] matrix
        let program = KernelProgram {
            name: "Flip".into(),
            inputs: vec![KernelInput::indexed("X", [2, 3], DataType::I32)],
            output: KernelOutput {
                dims: [2, 3].into(),
                r#type: DataType::I32,
            },
            body: KernelBody {
                remap: vec![IndexOp::Reverse { axis: 0, len: 2 }],
                value: Expr::Read(0),
            },
        };
        let kernel = cpu.compile(&program)?;
        assert_eq!(kernel.program(), &program);

        let x: Vec<u8> = [0i32, 1, 2, 3, 4, 5]
            .iter()
            .flat_map(|x| x.to_ne_bytes())
            .collect();
        let x = cpu.upload(DataType::I32, &x)?;
        let output = cpu.execute(&kernel, &[&x])?;
        let output: Vec<i32> = bytemuck::pod_collect_to_vec(&output[..]);
        assert_eq!(output, [3, 4, 5, 0, 1, 2]);

        Ok(())
    }

    #[test]
    fn test_execute_binding() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let program = KernelProgram {
            name: "Copy".into(),
            inputs: vec![KernelInput::indexed("X", [4], DataType::F32)],
            output: KernelOutput {
                dims: [4].into(),
                r#type: DataType::F32,
            },
            body: KernelBody {
                remap: vec![],
                value: Expr::Read(0),
            },
        };
        let kernel = cpu.compile(&program)?;

        let x = cpu.upload(DataType::F32, &[0; 12])?;
        assert!(matches!(
            cpu.execute(&kernel, &[&x]),
            Err(DeviceError::Size(0, 16, 12))
        ));
        assert!(matches!(
            cpu.execute(&kernel, &[]),
            Err(DeviceError::Arity(1, 0))
        ));

        Ok(())
    }

    #[test]
    fn test_compile_rejects_malformed() {
        let cpu = Cpu;
        let program = KernelProgram {
            name: "Broken".into(),
            inputs: vec![KernelInput::indexed("X", [4], DataType::F32)],
            output: KernelOutput {
                dims: [4].into(),
                r#type: DataType::F32,
            },
            body: KernelBody {
                remap: vec![IndexOp::Offset { axis: 0, offset: 1 }],
                value: Expr::Read(0),
            },
        };
        assert!(matches!(
            cpu.compile(&program),
            Err(DeviceError::Compile(_))
        ));
    }
}
