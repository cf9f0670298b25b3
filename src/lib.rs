//! Operator kernels for a GPU tensor inference engine.
//!
//! - [`loom`] holds tensors, kernel programs and the devices that run them.
//! - [`hal`] holds the operators, which validate their inputs, generate kernel programs, and run
//!   them through a caching [`hal::handler::Handler`].

pub mod hal;
pub mod loom;
