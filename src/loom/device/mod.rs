use thiserror::Error;

use super::{
    kernel::{KernelError, KernelProgram},
    num::DataType,
};

pub use cpu::Cpu;
pub use gpu::{Gpu, GpuBuildError, GpuBuilder};

pub mod cpu;
pub mod gpu;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("kernel compilation error: {0}")]
    Compile(#[from] KernelError),
    #[error("shader compilation error: {0}")]
    Shader(String),
    #[error("{0} is not supported by the device")]
    Unsupported(String),
    #[error("kernel expects {0} inputs, {1} bound")]
    Arity(usize, usize),
    #[error("kernel input {0} expects {1} bytes, bound buffer holds {2}")]
    Size(usize, usize, usize),
    #[error("kernel execution error: {0}")]
    Execute(String),
    #[error("buffer map error: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("device poll error: {0}")]
    Poll(String),
    #[error("failed to receive from the device")]
    Recv(#[from] flume::RecvError),
}

/// The device collaborator of the execution handler: owns storage, compiles and runs kernels.
///
/// Every call returns when its work is logically complete.
pub trait Device: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Device-resident storage of one tensor.
    type Buffer: std::fmt::Debug + Clone + Send + Sync;
    /// An executable kernel.
    type Kernel: std::fmt::Debug + Send + Sync;

    /// Copies host contents of the given type into a new buffer.
    fn upload(&self, r#type: DataType, contents: &[u8]) -> Result<Self::Buffer, DeviceError>;

    /// Reads back the contents of a buffer holding elements of the given type.
    fn read(&self, r#type: DataType, buffer: &Self::Buffer) -> Result<Box<[u8]>, DeviceError>;

    /// Logical size of the buffer in bytes, i.e., element count times the host element size.
    fn size(&self, buffer: &Self::Buffer) -> usize;

    /// Builds an executable kernel. Must reject programs failing [`KernelProgram::check`].
    fn compile(&self, program: &KernelProgram) -> Result<Self::Kernel, DeviceError>;

    /// Runs a kernel against bound inputs and returns the newly populated output buffer.
    fn execute(
        &self,
        kernel: &Self::Kernel,
        inputs: &[&Self::Buffer],
    ) -> Result<Self::Buffer, DeviceError>;

    /// Boolean view of a buffer holding elements of the given type: strictly positive reads as
    /// `true`. The returned buffer holds [`DataType::Bool`] elements.
    fn logical(&self, r#type: DataType, buffer: &Self::Buffer)
    -> Result<Self::Buffer, DeviceError>;
}
