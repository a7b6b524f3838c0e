//! dgpu runtime: device streams, kernel modules and events behind a C ABI
//!
//! The native half of the compiler's GPU lowering. Compiled code drives it
//! through the `dgpu_*` entry points in [`abi`]; Rust callers use the same
//! machinery directly:
//! - [`Stream`]: one device queue with reference-counted lifetime
//! - [`Module`] / [`Kernel`]: loaded binaries and their entry points
//! - [`EventHandle`]: completion of a launch or allocation, recycled per stream
//! - [`GpuParamDesc`]: the tagged kernel-argument encoding
//!
//! # Architecture
//!
//! ```text
//! C ABI → Stream → DeviceQueue (backend trait) → host backend → interpreter
//!            ↘ EventPool      ↘ allocator
//! ```
//!
//! Devices come from a [`backend::Backend`]. The bundled host backend runs
//! kernels on the CPU, so everything here works without GPU hardware.

pub mod abi;
pub mod backend;
pub mod config;
pub mod error;
pub mod event_pool;
pub mod ir;
pub mod module;
pub mod param;
pub mod stream;

pub use backend::{Backend, DeviceInfo, DeviceType};
pub use error::{Result, RuntimeError};
pub use event_pool::EventHandle;
pub use module::{Kernel, Module};
pub use param::{AllocType, GpuAllocResult, GpuParamDesc, KernelArg, ParamType};
pub use stream::Stream;

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
