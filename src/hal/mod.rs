//! Operators and their execution: cache keys, kernel program generators, and the handler that
//! compiles and runs them on a device.

pub mod handler;
pub mod key;
pub mod ops;
