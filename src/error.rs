//! Runtime errors
//!
//! Every fallible operation inside the runtime returns [`RuntimeError`]. The
//! C ABI layer converts these into the thread-local error slot; they never
//! cross the boundary as unwinding panics.

use miette::Diagnostic;
use thiserror::Error;

use crate::param::AllocType;

/// Result alias used throughout the runtime
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Runtime error
#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum RuntimeError {
    // === Device selection ===
    #[error("No device matches selector `{selector}`")]
    #[diagnostic(
        code(dgpu::device_not_found),
        help("run `dgpu devices` to list the available devices and their selectors")
    )]
    DeviceNotFound { selector: String },

    #[error("Invalid device selector `{selector}`: {reason}")]
    #[diagnostic(code(dgpu::invalid_selector))]
    InvalidSelector { selector: String, reason: String },

    // === Modules and kernels ===
    #[error("Malformed kernel module: {reason}")]
    #[diagnostic(code(dgpu::malformed_module))]
    MalformedModule { reason: String },

    #[error("Kernel `{name}` not found in module")]
    #[diagnostic(code(dgpu::kernel_not_found))]
    KernelNotFound { name: String },

    #[error("Kernel `{kernel}` launched after its module was destroyed")]
    #[diagnostic(code(dgpu::module_destroyed))]
    ModuleDestroyed { kernel: String },

    // === Memory ===
    #[error("Failed to allocate {kind} memory ({size} bytes, alignment {alignment})")]
    #[diagnostic(code(dgpu::allocation_failed))]
    AllocationFailed {
        kind: AllocType,
        size: usize,
        alignment: usize,
    },

    #[error("Invalid allocation type: {0}")]
    #[diagnostic(code(dgpu::invalid_alloc_type))]
    InvalidAllocType(i32),

    #[error("Pointer {addr:#x} was not allocated by this stream")]
    #[diagnostic(code(dgpu::unknown_allocation))]
    UnknownAllocation { addr: usize },

    // === Launch ===
    #[error("Invalid kernel parameter #{index}: {reason}")]
    #[diagnostic(code(dgpu::invalid_param))]
    InvalidParam { index: usize, reason: String },

    #[error("Arguments do not match kernel `{kernel}`: {reason}")]
    #[diagnostic(code(dgpu::param_mismatch))]
    ParamMismatch { kernel: String, reason: String },

    #[error("Invalid launch configuration: {0}")]
    #[diagnostic(code(dgpu::invalid_launch))]
    InvalidLaunch(String),

    #[error("Kernel `{kernel}` failed: {reason}")]
    #[diagnostic(code(dgpu::execution_failed))]
    ExecutionFailed { kernel: String, reason: String },

    // === Handles and ABI input ===
    #[error("{what} list has no terminator within {limit} entries")]
    #[diagnostic(code(dgpu::unterminated_list))]
    UnterminatedList { what: &'static str, limit: usize },

    #[error("Null {0} handle")]
    #[diagnostic(code(dgpu::null_handle))]
    NullHandle(&'static str),

    #[error("Event does not belong to this stream")]
    #[diagnostic(code(dgpu::foreign_event))]
    ForeignEvent,

    #[error("Device queue is closed")]
    #[diagnostic(code(dgpu::queue_closed))]
    QueueClosed,
}

impl RuntimeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        RuntimeError::MalformedModule {
            reason: reason.into(),
        }
    }

    pub fn invalid_param(index: usize, reason: impl Into<String>) -> Self {
        RuntimeError::InvalidParam {
            index,
            reason: reason.into(),
        }
    }
}
