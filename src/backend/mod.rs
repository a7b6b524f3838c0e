//! Compute backend interface
//!
//! A [`Stream`](crate::stream::Stream) never talks to hardware directly; it
//! drives a [`DeviceQueue`] obtained from a [`Backend`]. Backends supply:
//! - Device enumeration (matched against selector strings)
//! - Module loading from compiled bytes
//! - Asynchronous kernel submission with event dependencies
//! - Aligned device/shared allocation
//!
//! The crate ships the [`host::HostBackend`], which runs kernels on the CPU.

pub mod host;
pub mod selector;

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Result, RuntimeError};
use crate::param::{AllocType, KernelArg, ParamType};

/// Device class used by selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(DeviceType::Cpu),
            "gpu" => Some(DeviceType::Gpu),
            "accelerator" | "acc" => Some(DeviceType::Accelerator),
            _ => None,
        }
    }

    /// Preference when a selector matches several devices
    pub fn score(self) -> u32 {
        match self {
            DeviceType::Gpu => 3,
            DeviceType::Accelerator => 2,
            DeviceType::Cpu => 1,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Gpu => write!(f, "gpu"),
            DeviceType::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Device information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub backend: String,
    pub device_type: DeviceType,
    /// Position in the backend's device list
    pub index: usize,
    pub name: String,
    pub compute_capability: (u32, u32),
    pub total_memory: u64,
    pub multiprocessors: u32,
    pub max_threads_per_block: u32,
    pub warp_size: u32,
    pub shared_mem_per_block: u32,
}

impl DeviceInfo {
    pub fn host_cpu(index: usize) -> Self {
        Self {
            backend: "host".to_string(),
            device_type: DeviceType::Cpu,
            index,
            name: "Host CPU".to_string(),
            compute_capability: (1, 0),
            total_memory: 4 * 1024 * 1024 * 1024, // 4 GB
            multiprocessors: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            max_threads_per_block: 1024,
            warp_size: 1,
            shared_mem_per_block: 64 * 1024,
        }
    }

    pub fn simulated_gpu(index: usize) -> Self {
        Self {
            backend: "host".to_string(),
            device_type: DeviceType::Gpu,
            index,
            name: "Simulated GPU".to_string(),
            compute_capability: (1, 0),
            total_memory: 1024 * 1024 * 1024, // 1 GB
            multiprocessors: 1,
            max_threads_per_block: 1024,
            warp_size: 32,
            shared_mem_per_block: 48 * 1024,
        }
    }

    /// Fully qualified selector string for this device
    pub fn selector(&self) -> String {
        format!("{}:{}:{}", self.backend, self.device_type, self.index)
    }
}

/// Execution range in backend order: dimension 2 is the fastest varying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 3],
    pub local: [usize; 3],
    group_size: usize,
    group_total: usize,
}

impl NdRange {
    /// Build the range from `(x, y, z)` block counts and block shapes.
    /// The global range is their product with the dimension order reversed,
    /// so that x becomes the innermost dimension.
    pub fn from_grid_block(grid: [usize; 3], block: [usize; 3]) -> Result<Self> {
        if grid.contains(&0) || block.contains(&0) {
            return Err(RuntimeError::InvalidLaunch(format!(
                "zero-sized launch (grid {:?}, block {:?})",
                grid, block
            )));
        }
        let overflow = |what: &str| {
            RuntimeError::InvalidLaunch(format!(
                "{} overflows (grid {:?}, block {:?})",
                what, grid, block
            ))
        };
        let mut global = [0usize; 3];
        for d in 0..3 {
            global[2 - d] = grid[d]
                .checked_mul(block[d])
                .ok_or_else(|| overflow("global range"))?;
        }
        let group_size = block
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| overflow("block size"))?;
        let group_total = grid
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| overflow("group count"))?;
        group_size
            .checked_mul(group_total)
            .ok_or_else(|| overflow("work-item count"))?;
        Ok(Self {
            global,
            local: [block[2], block[1], block[0]],
            group_size,
            group_total,
        })
    }

    /// Number of groups per dimension
    pub fn group_counts(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            self.global[2] / self.local[2],
        ]
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn group_total(&self) -> usize {
        self.group_total
    }
}

/// Completion state of a submitted operation
#[derive(Debug, Clone, PartialEq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed(RuntimeError),
}

struct EventState {
    status: Mutex<EventStatus>,
    signal: Condvar,
}

/// Backend completion latch shared between the submitter and the executor
#[derive(Clone)]
pub struct DeviceEvent {
    state: Arc<EventState>,
}

impl DeviceEvent {
    /// A pending event
    pub fn new() -> Self {
        Self {
            state: Arc::new(EventState {
                status: Mutex::new(EventStatus::Pending),
                signal: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete
    pub fn completed() -> Self {
        let event = Self::new();
        event.complete();
        event
    }

    pub fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    pub fn fail(&self, error: RuntimeError) {
        self.finish(EventStatus::Failed(error));
    }

    fn finish(&self, status: EventStatus) {
        let mut current = self.state.status.lock();
        if *current == EventStatus::Pending {
            *current = status;
        }
        self.state.signal.notify_all();
    }

    /// Block until the operation finishes
    pub fn wait(&self) -> Result<()> {
        let mut status = self.state.status.lock();
        while *status == EventStatus::Pending {
            self.state.signal.wait(&mut status);
        }
        match &*status {
            EventStatus::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub fn status(&self) -> EventStatus {
        self.state.status.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.status() != EventStatus::Pending
    }
}

impl Default for DeviceEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("status", &self.status())
            .finish()
    }
}

/// A kernel ready for submission
pub struct KernelLaunch {
    pub kernel: Arc<dyn DeviceKernel>,
    pub range: NdRange,
    pub deps: Vec<DeviceEvent>,
    pub args: Vec<KernelArg>,
}

/// A compute backend: enumerates devices and opens queues on them
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn devices(&self) -> Vec<DeviceInfo>;

    fn create_queue(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceQueue>>;
}

/// One device command queue
pub trait DeviceQueue: Send + Sync {
    fn device(&self) -> &DeviceInfo;

    /// Parse compiled bytes into an executable module
    fn load_module(&self, image: &[u8]) -> Result<Arc<dyn DeviceModule>>;

    /// Enqueue a kernel; returns as soon as the work is queued
    fn submit(&self, launch: KernelLaunch) -> Result<DeviceEvent>;

    /// Aligned allocation; `None` when the request cannot be satisfied
    fn alloc(&self, kind: AllocType, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must not be used by any pending or future work.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Occupancy-based block size suggestion, one entry per grid dimension
    fn suggest_block_size(&self, kernel: &dyn DeviceKernel, grid: &[u32]) -> Result<Vec<u32>>;
}

/// A loaded module
pub trait DeviceModule: Send + Sync {
    fn name(&self) -> &str;

    fn kernel(&self, name: &str) -> Result<Arc<dyn DeviceKernel>>;

    fn kernel_names(&self) -> Vec<String>;
}

/// A named entry point inside a loaded module
pub trait DeviceKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Descriptor kinds of the kernel's parameters, in order
    fn param_types(&self) -> Vec<ParamType>;

    /// Work-group size limit declared by the kernel, if any
    fn max_threads(&self) -> Option<u32>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

static DEFAULT_BACKEND: OnceLock<Arc<host::HostBackend>> = OnceLock::new();

/// Process-wide backend used by `Stream::create` and the C ABI
pub fn default_backend() -> Arc<dyn Backend> {
    DEFAULT_BACKEND
        .get_or_init(|| Arc::new(host::HostBackend::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nd_range_reverses_dimensions() {
        let range = NdRange::from_grid_block([4, 2, 1], [8, 3, 1]).unwrap();
        assert_eq!(range.global, [1, 6, 32]);
        assert_eq!(range.local, [1, 3, 8]);
        assert_eq!(range.group_counts(), [1, 2, 4]);
        assert_eq!(range.group_size(), 24);
        assert_eq!(range.group_total(), 8);
    }

    #[test]
    fn test_nd_range_rejects_zero() {
        assert!(NdRange::from_grid_block([0, 1, 1], [1, 1, 1]).is_err());
        assert!(NdRange::from_grid_block([1, 1, 1], [1, 0, 1]).is_err());
    }

    #[test]
    fn test_nd_range_rejects_overflow() {
        let err = NdRange::from_grid_block([1, 1, 1], [1 << 33, 1 << 33, 1]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLaunch(ref m) if m.contains("block size")), "{}", err);

        let err = NdRange::from_grid_block([1 << 33, 1 << 33, 1], [1, 1, 1]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLaunch(ref m) if m.contains("group count")), "{}", err);

        let err = NdRange::from_grid_block([usize::MAX, 1, 1], [2, 1, 1]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLaunch(ref m) if m.contains("global range")), "{}", err);
    }

    #[test]
    fn test_event_completion() {
        let event = DeviceEvent::new();
        assert!(!event.is_complete());

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait())
        };
        event.complete();
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_event_failure_is_sticky() {
        let event = DeviceEvent::new();
        event.fail(RuntimeError::QueueClosed);
        event.complete();
        assert_eq!(event.wait(), Err(RuntimeError::QueueClosed));
    }

    #[test]
    fn test_device_selector_string() {
        assert_eq!(DeviceInfo::simulated_gpu(1).selector(), "host:gpu:1");
    }
}
