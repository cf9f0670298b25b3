use std::sync::{Arc, Mutex};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{key::CacheKey, ops::OpError};
use crate::loom::{
    device::Device,
    kernel::{Access, KernelInput, KernelOutput, KernelProgram},
    tensor::{Origin, Tensor},
};

/// A compiled kernel together with the declarations it was compiled from.
struct Compiled<D: Device> {
    kernel: D::Kernel,
    inputs: Vec<KernelInput>,
    output: KernelOutput,
}

/// Runs operator kernels on one device, compiling each distinct [`CacheKey`] once.
pub struct Handler<D: Device> {
    device: D,
    cache: Mutex<HashMap<CacheKey, Arc<Compiled<D>>>>,
}

impl<D: Device> std::fmt::Debug for Handler<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("device", &self.device)
            .field("kernels", &self.len())
            .finish()
    }
}

impl<D: Device> Handler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            cache: Default::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Number of compiled kernels in the cache.
    #[inline]
    pub fn len(&self) -> usize {
        self.cache.lock().expect("failed to lock cache").len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the kernel cached under `key`, or builds the program with `factory`, compiles it
    /// and caches it. Failed compilations are not cached.
    fn fetch<F>(&self, key: CacheKey, factory: F) -> Result<Arc<Compiled<D>>, OpError>
    where
        F: FnOnce() -> KernelProgram,
    {
        let mut cache = self.cache.lock().expect("failed to lock cache");
        if let Some(compiled) = cache.get(&key) {
            log::debug!("cache hit: {key}");
            return Ok(compiled.clone());
        }

        log::debug!("cache miss: {key}");
        let program = factory();
        log::debug!("compile: {program}");
        let kernel = match self.device.compile(&program) {
            Ok(kernel) => kernel,
            Err(err) => {
                log::warn!("failed to compile {}: {err}", program.name);
                return Err(err.into());
            }
        };

        let KernelProgram { inputs, output, .. } = program;
        let compiled = Arc::new(Compiled {
            kernel,
            inputs,
            output,
        });
        cache.insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Runs the kernel identified by `key` against `inputs` and returns a fresh output tensor.
    ///
    /// `factory` is only invoked on a cache miss. Inputs declared with [`Access::Logical`] are
    /// bound through their boolean view.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(key = %key)))]
    pub fn run<F>(
        &self,
        key: CacheKey,
        factory: F,
        inputs: &[&Tensor<D>],
    ) -> Result<Tensor<D>, OpError>
    where
        F: FnOnce() -> KernelProgram,
    {
        let compiled = self.fetch(key, factory)?;
        if inputs.len() != compiled.inputs.len() {
            return Err(OpError::Arity(compiled.inputs.len(), inputs.len()));
        }

        let mut bound = Vec::with_capacity(inputs.len());
        for (index, (decl, &tensor)) in compiled.inputs.iter().zip_eq(inputs).enumerate() {
            let tensor = match decl.access {
                Access::Indexed => tensor.clone(),
                Access::Logical => tensor.logical()?,
            };
            if tensor.data_type() != decl.r#type || tensor.dims() != decl.dims {
                let dims = |dims: &[usize]| format!("[{}]", dims.iter().format(", "));
                return Err(OpError::Binding {
                    index,
                    name: decl.name.to_string(),
                    expected: format!("{}{}", decl.r#type, dims(&decl.dims)),
                    found: format!("{}{}", tensor.data_type(), dims(&tensor.dims())),
                });
            }
            bound.push(tensor);
        }

        let buffers = bound.iter().map(|tensor| tensor.buffer()).collect_vec();
        let buffer = self.device.execute(&compiled.kernel, &buffers)?;

        let output = &compiled.output;
        let tensor = Tensor::from_buffer(
            self.device.clone(),
            output.dims.clone(),
            output.r#type,
            Origin::Runtime,
            buffer,
        )?;
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, error::Error};

    use super::Handler;
    use crate::{
        hal::{
            key::{ArgMaxKey, CacheKey, WhereKey},
            ops::OpError,
        },
        loom::{
            device::{Cpu, DeviceError},
            kernel::{Expr, IndexOp, KernelBody, KernelInput, KernelOutput, KernelProgram},
            num::{Bool, DataType},
            tensor::{Origin, Tensor},
        },
    };

    fn first(dims: &[usize]) -> KernelProgram {
        KernelProgram {
            name: "First".into(),
            inputs: vec![KernelInput::indexed("X", dims, DataType::F32)],
            output: KernelOutput {
                dims: [0usize; 0].into(),
                r#type: DataType::F32,
            },
            body: KernelBody {
                remap: vec![],
                value: Expr::Read(0),
            },
        }
    }

    fn key(dims: &[usize]) -> CacheKey {
        CacheKey::from(ArgMaxKey {
            r#type: DataType::F32,
            dims: dims.into(),
        })
    }

    #[test]
    fn test_cache() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);
        let calls = Cell::new(0);
        let factory = |dims: &'static [usize]| {
            let calls = &calls;
            move || {
                calls.set(calls.get() + 1);
                first(dims)
            }
        };

        let x = Tensor::create(&cpu, [2, 2], &[4.0f32, 3.0, 2.0, 1.0])?;
        let y = Tensor::create(&cpu, [2, 2], &[5.0f32, 6.0, 7.0, 8.0])?;

        let output = handler.run(key(&[2, 2]), factory(&[2, 2]), &[&x])?;
        assert_eq!(output.back::<f32>()?.as_ref(), &[4.0]);
        assert_eq!(output.origin(), Origin::Runtime);
        assert_eq!(calls.get(), 1);

        // a hit never calls the factory, and still gives a fresh output
        let output = handler.run(key(&[2, 2]), factory(&[2, 2]), &[&y])?;
        assert_eq!(output.back::<f32>()?.as_ref(), &[5.0]);
        assert_eq!(calls.get(), 1);
        assert_eq!(handler.len(), 1);

        let z = Tensor::create(&cpu, [4], &[9.0f32, 0.0, 0.0, 0.0])?;
        let output = handler.run(key(&[4]), factory(&[4]), &[&z])?;
        assert_eq!(output.back::<f32>()?.as_ref(), &[9.0]);
        assert_eq!(calls.get(), 2);
        assert_eq!(handler.len(), 2);

        Ok(())
    }

    #[test]
    fn test_determinism() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let data: Vec<f32> = (0..24).map(|_| fastrand::f32()).collect();
        let x = Tensor::create(&cpu, [2, 3, 4], &data)?;
        let program = || KernelProgram {
            name: "Flip".into(),
            inputs: vec![KernelInput::indexed("X", [2, 3, 4], DataType::F32)],
            output: KernelOutput {
                dims: [2, 3, 4].into(),
                r#type: DataType::F32,
            },
            body: KernelBody {
                remap: vec![IndexOp::Reverse { axis: 1, len: 3 }],
                value: Expr::Read(0),
            },
        };

        let a = handler.run(key(&[2, 3, 4]), program, &[&x])?.back::<f32>()?;
        let b = handler.run(key(&[2, 3, 4]), program, &[&x])?.back::<f32>()?;
        assert_eq!(a, b);
        assert_eq!(a[0], data[8]);
        assert_eq!(a[23], data[15]);

        Ok(())
    }

    #[test]
    fn test_compile_error_not_cached() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);
        let x = Tensor::create(&cpu, [4], &[1.0f32, 2.0, 3.0, 4.0])?;

        let broken = || {
            let mut program = first(&[4]);
            program.output.dims = [4].into();
            program.body.remap = vec![IndexOp::Offset { axis: 0, offset: 1 }];
            program
        };
        let result = handler.run(key(&[4]), broken, &[&x]);
        assert!(matches!(
            result,
            Err(OpError::Device(DeviceError::Compile(_)))
        ));
        assert!(handler.is_empty());

        // the same key compiles again on the next call
        let output = handler.run(key(&[4]), || first(&[4]), &[&x])?;
        assert_eq!(output.back::<f32>()?.as_ref(), &[1.0]);
        assert_eq!(handler.len(), 1);

        Ok(())
    }

    #[test]
    fn test_binding() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);
        let x = Tensor::create(&cpu, [4], &[1.0f32, 2.0, 3.0, 4.0])?;
        let y = Tensor::create(&cpu, [4], &[1i32, 2, 3, 4])?;

        assert!(matches!(
            handler.run(key(&[4]), || first(&[4]), &[]),
            Err(OpError::Arity(1, 0))
        ));
        assert!(matches!(
            handler.run(key(&[4]), || first(&[4]), &[&y]),
            Err(OpError::Binding { index: 0, .. })
        ));
        assert!(handler.run(key(&[4]), || first(&[4]), &[&x]).is_ok());

        Ok(())
    }

    #[test]
    fn test_logical_binding() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu;
        let handler = Handler::new(cpu);

        let program = || KernelProgram {
            name: "Where".into(),
            inputs: vec![
                KernelInput::logical("C", [4]),
                KernelInput::indexed("X", [4], DataType::I32),
                KernelInput::indexed("Y", [4], DataType::I32),
            ],
            output: KernelOutput {
                dims: [4].into(),
                r#type: DataType::I32,
            },
            body: KernelBody {
                remap: vec![],
                value: Expr::select(Expr::Read(0), Expr::Read(1), Expr::Read(2)),
            },
        };
        let key = CacheKey::from(WhereKey {
            r#type: DataType::I32,
            condition: [4].into(),
            x: [4].into(),
            y: [4].into(),
        });

        let c = Tensor::create(&cpu, [4], &[-1.0f32, 0.0, 0.25, 2.0])?;
        let x = Tensor::create(&cpu, [4], &[1i32, 2, 3, 4])?;
        let y = Tensor::create(&cpu, [4], &[-1i32, -2, -3, -4])?;
        let output = handler.run(key.clone(), program, &[&c, &x, &y])?;
        assert_eq!(output.back::<i32>()?.as_ref(), &[-1, -2, 3, 4]);

        let c = Tensor::create(&cpu, [4], &[Bool::from(true); 4])?;
        let output = handler.run(key, program, &[&c, &x, &y])?;
        assert_eq!(output.back::<i32>()?.as_ref(), &[1, 2, 3, 4]);

        Ok(())
    }
}
