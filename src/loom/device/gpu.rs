use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};

use rustc_hash::FxHashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{Device, DeviceError};
use crate::loom::{
    kernel::{Expr, KernelBody, KernelInput, KernelOutput, KernelProgram},
    num::DataType,
};

pub mod shader;

/// Storage of one tensor on the GPU.
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    /// Logical size in bytes, which may be smaller than the physical buffer.
    size: usize,
}

impl GpuBuffer {
    #[inline]
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// A compiled compute pipeline with everything needed to launch it.
#[derive(Debug, Clone)]
pub struct GpuKernel {
    name: Cow<'static, str>,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    dispatch: shader::Dispatch,
    inputs: Vec<KernelInput>,
    output: KernelOutput,
}

impl GpuKernel {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct Gpu {
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Number of invocations per workgroup of every kernel.
    workgroup_size: u32,
    /// Boolean view kernels, keyed by source type and element count.
    logicals: Arc<Mutex<FxHashMap<(DataType, usize), GpuKernel>>>,
}

/// Physical size of a buffer holding `count` elements of the type.
#[inline]
fn physical_size(r#type: DataType, count: usize) -> usize {
    let size = match r#type {
        DataType::Bool => count * 4,
        r#type => count * r#type.size(),
    };
    size.next_multiple_of(4).max(4)
}

impl Gpu {
    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    #[inline]
    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// Number of boolean view kernels compiled so far.
    pub fn num_logical_kernels(&self) -> usize {
        self.logicals.lock().expect("failed to lock logicals").len()
    }

    fn logical_kernel(&self, r#type: DataType, count: usize) -> Result<GpuKernel, DeviceError> {
        let mut logicals = self.logicals.lock().expect("failed to lock logicals");
        if let Some(kernel) = logicals.get(&(r#type, count)) {
            return Ok(kernel.clone());
        }

        let program = KernelProgram {
            name: "Logical".into(),
            inputs: vec![KernelInput::indexed("X", [count], r#type)],
            output: KernelOutput {
                dims: [count].into(),
                r#type: DataType::Bool,
            },
            body: KernelBody {
                remap: vec![],
                value: Expr::Logical(Box::new(Expr::Read(0))),
            },
        };
        log::debug!("compile: {program}");
        let kernel = self.compile(&program)?;
        logicals.insert((r#type, count), kernel.clone());
        Ok(kernel)
    }

    fn create_pipeline(
        &self,
        name: &str,
        source: String,
    ) -> Result<wgpu::ComputePipeline, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        match futures::executor::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(DeviceError::Shader(err.to_string())),
            None => Ok(pipeline),
        }
    }

    fn create_output(&self, output: &KernelOutput) -> GpuBuffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: physical_size(output.r#type, output.count()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let size = output.data_size();
        GpuBuffer { buffer, size }
    }
}

impl Device for Gpu {
    type Buffer = GpuBuffer;
    type Kernel = GpuKernel;

    fn upload(&self, r#type: DataType, contents: &[u8]) -> Result<Self::Buffer, DeviceError> {
        let size = contents.len();
        let mut data: Vec<u8> = match r#type {
            DataType::Bool => contents.iter().flat_map(|&x| (x as u32).to_ne_bytes()).collect(),
            _ => contents.to_vec(),
        };
        data.resize(physical_size(r#type, size / r#type.size()), 0);

        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: &data,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        Ok(GpuBuffer { buffer, size })
    }

    fn read(&self, r#type: DataType, buffer: &Self::Buffer) -> Result<Box<[u8]>, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        wgpu::util::DownloadBuffer::read_buffer(
            &self.device,
            &self.queue,
            &buffer.buffer.slice(..),
            move |data| {
                let data = data
                    .map(|data| data.to_vec())
                    .map_err(DeviceError::from);
                _ = sender.send(data)
            },
        );
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| DeviceError::Poll(err.to_string()))?;
        let data = receiver.recv()??;

        let data: Box<[u8]> = match r#type {
            DataType::Bool => data
                .chunks_exact(4)
                .take(buffer.size)
                .map(|x| x.iter().any(|&x| x != 0) as u8)
                .collect(),
            _ => data[..buffer.size].into(),
        };
        Ok(data)
    }

    #[inline]
    fn size(&self, buffer: &Self::Buffer) -> usize {
        buffer.size
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(name = %program.name)))]
    fn compile(&self, program: &KernelProgram) -> Result<Self::Kernel, DeviceError> {
        program.check()?;

        let max = self.device.limits().max_compute_workgroups_per_dimension;
        let dispatch = shader::Dispatch::new(program.output.count(), self.workgroup_size, max)?;
        let source = shader::emit(program, self.workgroup_size, dispatch)?;
        log::trace!("{source}");
        shader::validate(&source)?;

        let pipeline = self.create_pipeline(&program.name, source)?;
        let layout = pipeline.get_bind_group_layout(0);
        Ok(GpuKernel {
            name: program.name.clone(),
            pipeline,
            layout,
            dispatch,
            inputs: program.inputs.clone(),
            output: program.output.clone(),
        })
    }

    fn execute(
        &self,
        kernel: &Self::Kernel,
        inputs: &[&Self::Buffer],
    ) -> Result<Self::Buffer, DeviceError> {
        if inputs.len() != kernel.inputs.len() {
            return Err(DeviceError::Arity(kernel.inputs.len(), inputs.len()));
        }
        for (index, (decl, buffer)) in kernel.inputs.iter().zip(inputs).enumerate() {
            if buffer.size != decl.data_size() {
                return Err(DeviceError::Size(index, decl.data_size(), buffer.size));
            }
        }

        let output = self.create_output(&kernel.output);
        if kernel.output.count() == 0 {
            return Ok(output);
        }

        let entries: Vec<_> = inputs
            .iter()
            .map(|x| &x.buffer)
            .chain(Some(&output.buffer))
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bindings = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.name),
            layout: &kernel.layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bindings, &[]);
            let [x, y, z] = kernel.dispatch.groups;
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(output)
    }

    fn logical(
        &self,
        r#type: DataType,
        buffer: &Self::Buffer,
    ) -> Result<Self::Buffer, DeviceError> {
        let count = buffer.size / r#type.size();
        let kernel = self.logical_kernel(r#type, count)?;
        self.execute(&kernel, &[buffer])
    }
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    pub workgroup_size: u32,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
    #[error("workgroup size {0} exceeds the device limit {1}")]
    WorkgroupSize(u32, u32),
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        Self {
            adapter,
            features: wgpu::Features::empty(),
            limits: Default::default(),
            workgroup_size: 64,
        }
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
            workgroup_size,
        } = self;

        let max = limits
            .max_compute_workgroup_size_x
            .min(limits.max_compute_invocations_per_workgroup);
        if workgroup_size == 0 || workgroup_size > max {
            return Err(GpuBuildError::WorkgroupSize(workgroup_size, max));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        log::info!("{:#?}", adapter.get_info());
        Ok(Gpu {
            device,
            queue,
            workgroup_size,
            logicals: Default::default(),
        })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }

    pub fn workgroup_size(mut self, workgroup_size: u32) -> Self {
        self.workgroup_size = workgroup_size;
        self
    }
}
