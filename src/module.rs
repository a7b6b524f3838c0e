//! Module and kernel handles
//!
//! A [`Module`] wraps the backend's loaded form of a compiled binary. Kernels
//! resolved from it are independent handles with their own lifetime; they
//! remember the module only weakly, so launching a kernel whose module has
//! been destroyed is detected instead of running stale code.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::backend::{DeviceKernel, DeviceModule};
use crate::error::{Result, RuntimeError};
use crate::param::ParamType;

/// Loaded module
pub struct Module {
    inner: Arc<dyn DeviceModule>,
}

impl Module {
    pub fn new(inner: Arc<dyn DeviceModule>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kernel_names(&self) -> Vec<String> {
        self.inner.kernel_names()
    }

    /// Resolve a kernel by name
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let entry = self.inner.kernel(name)?;
        tracing::debug!(module = %self.name(), kernel = name, "resolved kernel");
        Ok(Kernel {
            name: name.to_string(),
            module: Arc::downgrade(&self.inner),
            entry,
        })
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("kernels", &self.kernel_names())
            .finish()
    }
}

/// Named entry point of a [`Module`]
pub struct Kernel {
    name: String,
    module: Weak<dyn DeviceModule>,
    entry: Arc<dyn DeviceKernel>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_types(&self) -> Vec<ParamType> {
        self.entry.param_types()
    }

    pub fn max_threads(&self) -> Option<u32> {
        self.entry.max_threads()
    }

    /// Whether the owning module is still alive
    pub fn is_live(&self) -> bool {
        self.module.strong_count() > 0
    }

    /// Backend entry point, if the module has not been destroyed
    pub fn entry(&self) -> Result<Arc<dyn DeviceKernel>> {
        if !self.is_live() {
            return Err(RuntimeError::ModuleDestroyed {
                kernel: self.name.clone(),
            });
        }
        Ok(self.entry.clone())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("params", &self.param_types())
            .field("live", &self.is_live())
            .finish()
    }
}
