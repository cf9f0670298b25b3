//! The `loom` module provides the foundations the operator kernels are built upon.
//!
//! ## Key Components
//! 1. **Numerical System**: element types ([`num::DataType`]) and the host scalars that carry them.
//! 2. **Tensors**: immutable N-dimensional arrays bound to a device ([`tensor::Tensor`]).
//! 3. **Kernel Programs**: per-output-element descriptions of a computation, with static
//!    validation ([`kernel::KernelProgram`]).
//! 4. **Device Abstraction**: the [`device::Device`] trait with a host reference interpreter
//!    ([`device::Cpu`]) and a WebGPU backend ([`device::Gpu`]).

pub mod device;
pub mod kernel;
pub mod num;
pub mod tensor;
