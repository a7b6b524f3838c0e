//! Host CPU backend
//!
//! Runs module binaries on the CPU. Each queue owns a worker thread that
//! drains submitted launches in FIFO order; a launch first waits for its
//! dependencies, then executes its work-groups on the rayon pool.
//!
//! Two devices are exposed so that selectors behave as they would on a
//! machine with a discrete accelerator:
//! - `host:cpu:0` - the host processor
//! - `host:gpu:1` - a simulated GPU with GPU-like limits

pub mod exec;
pub mod memory;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use indexmap::IndexMap;

use super::{
    Backend, DeviceEvent, DeviceInfo, DeviceKernel, DeviceModule, DeviceQueue, KernelLaunch,
    NdRange,
};
use crate::error::{Result, RuntimeError};
use crate::ir::binary;
use crate::ir::{GpuModule, GpuType, MemorySpace};
use crate::param::{AllocType, KernelArg, ParamType};
use exec::PreparedKernel;
use memory::HostAllocator;

/// CPU backend
pub struct HostBackend {
    devices: Vec<DeviceInfo>,
    live_queues: Arc<AtomicUsize>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceInfo::host_cpu(0), DeviceInfo::simulated_gpu(1)])
    }

    /// Backend exposing a custom device list
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            live_queues: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of queues created by this backend that are still open
    pub fn live_queues(&self) -> usize {
        self.live_queues.load(Ordering::SeqCst)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn create_queue(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceQueue>> {
        let queue = HostQueue::new(device.clone(), self.live_queues.clone())?;
        Ok(Box::new(queue))
    }
}

/// A kernel launch waiting on the worker
struct Job {
    kernel: Arc<HostKernel>,
    range: NdRange,
    args: Vec<KernelArg>,
    deps: Vec<DeviceEvent>,
    done: DeviceEvent,
}

impl Job {
    fn run(self) {
        let name = self.kernel.name().to_string();

        for dep in &self.deps {
            if let Err(err) = dep.wait() {
                tracing::debug!(kernel = %name, %err, "skipping launch after failed dependency");
                self.done.fail(RuntimeError::ExecutionFailed {
                    kernel: name,
                    reason: format!("predecessor failed: {}", err),
                });
                return;
            }
        }

        let prepared = &self.kernel.prepared;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            prepared.execute(&self.range, &self.args)
        }));
        match outcome {
            Ok(Ok(())) => {
                tracing::trace!(kernel = %name, groups = self.range.group_total(), "kernel complete");
                self.done.complete();
            }
            Ok(Err(fault)) => {
                tracing::warn!(kernel = %name, %fault, "kernel faulted");
                self.done.fail(RuntimeError::ExecutionFailed {
                    kernel: name,
                    reason: fault.to_string(),
                });
            }
            Err(_) => {
                tracing::error!(kernel = %name, "kernel execution panicked");
                self.done.fail(RuntimeError::ExecutionFailed {
                    kernel: name,
                    reason: "execution panicked".to_string(),
                });
            }
        }
    }
}

fn worker_loop(jobs: Receiver<Job>) {
    for job in jobs.iter() {
        job.run();
    }
}

/// In-order queue on one host device
pub struct HostQueue {
    device: DeviceInfo,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    allocator: HostAllocator,
    live_queues: Arc<AtomicUsize>,
}

impl HostQueue {
    fn new(device: DeviceInfo, live_queues: Arc<AtomicUsize>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let worker = thread::Builder::new()
            .name(format!("dgpu-{}", device.selector()))
            .spawn(move || worker_loop(receiver))
            .map_err(|_| RuntimeError::QueueClosed)?;

        live_queues.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(device = %device.selector(), "opened host queue");

        Ok(Self {
            allocator: HostAllocator::new(device.total_memory),
            device,
            sender: Some(sender),
            worker: Some(worker),
            live_queues,
        })
    }

    /// Check a launch against the kernel signature and device limits
    fn validate(&self, kernel: &HostKernel, range: &NdRange, args: &[KernelArg]) -> Result<()> {
        let gpu_kernel = kernel.prepared.kernel();
        let mismatch = |reason: String| RuntimeError::ParamMismatch {
            kernel: gpu_kernel.name.clone(),
            reason,
        };

        if args.len() != gpu_kernel.params.len() {
            return Err(mismatch(format!(
                "expected {} arguments, got {}",
                gpu_kernel.params.len(),
                args.len()
            )));
        }
        for (index, (arg, param)) in args.iter().zip(&gpu_kernel.params).enumerate() {
            if !arg_fits(arg, param.ty) {
                return Err(mismatch(format!(
                    "argument {} (`{}`) expects {}, got {}",
                    index,
                    param.name,
                    param.ty,
                    describe_arg(arg)
                )));
            }
        }

        let group_size = range.group_size();
        let limit = kernel
            .max_threads()
            .map_or(self.device.max_threads_per_block, |k| {
                k.min(self.device.max_threads_per_block)
            });
        if group_size > limit as usize {
            return Err(RuntimeError::InvalidLaunch(format!(
                "block of {} threads exceeds the limit of {}",
                group_size, limit
            )));
        }

        let local_bytes: usize = args
            .iter()
            .map(|a| match a {
                KernelArg::LocalMemory(size) => *size,
                _ => 0,
            })
            .sum::<usize>()
            + kernel.prepared.shared_size();
        if local_bytes > self.device.shared_mem_per_block as usize {
            return Err(RuntimeError::InvalidLaunch(format!(
                "{} bytes of local memory exceeds the limit of {}",
                local_bytes, self.device.shared_mem_per_block
            )));
        }

        Ok(())
    }
}

fn arg_fits(arg: &KernelArg, ty: GpuType) -> bool {
    match (arg, ty) {
        (KernelArg::Bool(_), GpuType::Bool)
        | (KernelArg::Int8(_), GpuType::I8)
        | (KernelArg::Int16(_), GpuType::I16)
        | (KernelArg::Int32(_), GpuType::I32)
        | (KernelArg::Int64(_), GpuType::I64)
        | (KernelArg::Float32(_), GpuType::F32)
        | (KernelArg::Float64(_), GpuType::F64) => true,
        (KernelArg::Pointer(_), GpuType::Ptr(space)) => space != MemorySpace::Shared,
        (KernelArg::LocalMemory(_), GpuType::Ptr(space)) => space != MemorySpace::Global,
        _ => false,
    }
}

fn describe_arg(arg: &KernelArg) -> String {
    match arg {
        KernelArg::LocalMemory(size) => format!("{} bytes of local memory", size),
        KernelArg::Pointer(_) => "a device pointer".to_string(),
        other => other.param_type().to_string(),
    }
}

/// Largest divisor of `n` that does not exceed `limit`
fn largest_divisor_at_most(n: u32, limit: u32) -> u32 {
    if n <= limit {
        return n;
    }
    (1..=limit).rev().find(|d| n % d == 0).unwrap_or(1)
}

impl DeviceQueue for HostQueue {
    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn load_module(&self, image: &[u8]) -> Result<Arc<dyn DeviceModule>> {
        let module = binary::decode(image)?;
        let limit = self.device.shared_mem_per_block;
        for kernel in module.kernels.values() {
            let shared = kernel.shared_mem_size().unwrap_or(u32::MAX);
            if shared > limit {
                return Err(RuntimeError::malformed(format!(
                    "kernel `{}` declares {} bytes of shared memory, the device allows {}",
                    kernel.name, shared, limit
                )));
            }
        }
        Ok(Arc::new(HostModule::new(module)?))
    }

    fn submit(&self, launch: KernelLaunch) -> Result<DeviceEvent> {
        let KernelLaunch {
            kernel,
            range,
            deps,
            args,
        } = launch;

        let name = kernel.name().to_string();
        let kernel = kernel
            .into_any()
            .downcast::<HostKernel>()
            .map_err(|_| {
                RuntimeError::InvalidLaunch(format!(
                    "kernel `{}` was not loaded by the host backend",
                    name
                ))
            })?;
        self.validate(&kernel, &range, &args)?;

        let done = DeviceEvent::new();
        let job = Job {
            kernel,
            range,
            args,
            deps,
            done: done.clone(),
        };
        self.sender
            .as_ref()
            .ok_or(RuntimeError::QueueClosed)?
            .send(job)
            .map_err(|_| RuntimeError::QueueClosed)?;

        tracing::trace!(kernel = %name, ?range, "kernel queued");
        Ok(done)
    }

    fn alloc(&self, kind: AllocType, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.allocator.alloc(kind, size, alignment)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        unsafe { self.allocator.free(ptr) }
    }

    fn suggest_block_size(&self, kernel: &dyn DeviceKernel, grid: &[u32]) -> Result<Vec<u32>> {
        if grid.is_empty() || grid.len() > 3 {
            return Err(RuntimeError::InvalidLaunch(format!(
                "grid must have 1 to 3 dimensions, got {}",
                grid.len()
            )));
        }

        let mut budget = kernel
            .max_threads()
            .map_or(self.device.max_threads_per_block, |k| {
                k.min(self.device.max_threads_per_block)
            })
            .max(1);

        let mut block = Vec::with_capacity(grid.len());
        for &size in grid {
            let chosen = largest_divisor_at_most(size.max(1), budget);
            block.push(chosen);
            budget = (budget / chosen).max(1);
        }
        Ok(block)
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued work and exit
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(device = %self.device.selector(), "queue worker panicked");
            }
        }
        self.live_queues.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(device = %self.device.selector(), "closed host queue");
    }
}

/// Module loaded by the host backend
pub struct HostModule {
    name: String,
    kernels: IndexMap<String, Arc<HostKernel>>,
}

impl HostModule {
    pub fn new(module: GpuModule) -> Result<Self> {
        let kernels = module
            .kernels
            .into_iter()
            .map(|(name, kernel)| {
                let kernel = Arc::new(HostKernel {
                    prepared: PreparedKernel::new(kernel)?,
                });
                Ok((name, kernel))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            name: module.name,
            kernels,
        })
    }
}

impl DeviceModule for HostModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kernel(&self, name: &str) -> Result<Arc<dyn DeviceKernel>> {
        self.kernels
            .get(name)
            .map(|k| k.clone() as Arc<dyn DeviceKernel>)
            .ok_or_else(|| RuntimeError::KernelNotFound {
                name: name.to_string(),
            })
    }

    fn kernel_names(&self) -> Vec<String> {
        self.kernels.keys().cloned().collect()
    }
}

/// Kernel entry point of a [`HostModule`]
#[derive(Debug)]
pub struct HostKernel {
    prepared: PreparedKernel,
}

impl DeviceKernel for HostKernel {
    fn name(&self) -> &str {
        &self.prepared.kernel().name
    }

    fn param_types(&self) -> Vec<ParamType> {
        self.prepared
            .kernel()
            .params
            .iter()
            .map(|p| match p.ty {
                GpuType::Bool => ParamType::Bool,
                GpuType::I8 => ParamType::Int8,
                GpuType::I16 => ParamType::Int16,
                GpuType::I32 => ParamType::Int32,
                GpuType::I64 => ParamType::Int64,
                GpuType::F32 => ParamType::Float32,
                GpuType::F64 => ParamType::Float64,
                GpuType::Ptr(_) => ParamType::Ptr,
            })
            .collect()
    }

    fn max_threads(&self) -> Option<u32> {
        self.prepared.kernel().max_threads
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GpuOp, GpuTerminator, KernelBuilder};

    fn open(device: DeviceInfo) -> HostQueue {
        HostQueue::new(device, Arc::new(AtomicUsize::new(0))).unwrap()
    }

    fn module_with(kernel: crate::ir::GpuKernel) -> Arc<dyn DeviceModule> {
        let mut module = GpuModule::new("test");
        module.add_kernel(kernel);
        Arc::new(HostModule::new(module).unwrap())
    }

    fn store_i32_kernel() -> crate::ir::GpuKernel {
        let mut b = KernelBuilder::new("store");
        let out = b.param("out", GpuType::Ptr(MemorySpace::Global));
        let v = b.param("v", GpuType::I32);
        b.op(GpuOp::Store(out, v));
        b.terminate(GpuTerminator::ReturnVoid);
        b.build()
    }

    fn launch(kernel: Arc<dyn DeviceKernel>, args: Vec<KernelArg>) -> KernelLaunch {
        KernelLaunch {
            kernel,
            range: NdRange::from_grid_block([1, 1, 1], [1, 1, 1]).unwrap(),
            deps: Vec::new(),
            args,
        }
    }

    #[test]
    fn test_live_queue_count() {
        let backend = HostBackend::new();
        let device = backend.devices()[0].clone();
        let queue = backend.create_queue(&device).unwrap();
        assert_eq!(backend.live_queues(), 1);
        drop(queue);
        assert_eq!(backend.live_queues(), 0);
    }

    #[test]
    fn test_submit_and_wait() {
        let queue = open(DeviceInfo::host_cpu(0));
        let kernel = module_with(store_i32_kernel()).kernel("store").unwrap();
        let mut out = 0i32;
        let args = vec![
            KernelArg::Pointer(&mut out as *mut i32 as usize),
            KernelArg::Int32(42),
        ];
        queue.submit(launch(kernel, args)).unwrap().wait().unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_param_mismatch() {
        let queue = open(DeviceInfo::host_cpu(0));
        let kernel = module_with(store_i32_kernel()).kernel("store").unwrap();

        let err = queue
            .submit(launch(kernel.clone(), vec![KernelArg::Int32(1)]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ParamMismatch { .. }));

        let err = queue
            .submit(launch(
                kernel,
                vec![KernelArg::Pointer(8), KernelArg::Float32(1.0)],
            ))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ParamMismatch { .. }));
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let queue = open(DeviceInfo::host_cpu(0));
        let kernel = module_with(store_i32_kernel()).kernel("store").unwrap();
        let failed = DeviceEvent::new();
        failed.fail(RuntimeError::QueueClosed);

        let mut out = 0i32;
        let mut job = launch(
            kernel,
            vec![
                KernelArg::Pointer(&mut out as *mut i32 as usize),
                KernelArg::Int32(7),
            ],
        );
        job.deps.push(failed);
        let result = queue.submit(job).unwrap().wait();
        assert!(matches!(result, Err(RuntimeError::ExecutionFailed { .. })));
        assert_eq!(out, 0);
    }

    #[test]
    fn test_block_limit() {
        let queue = open(DeviceInfo::simulated_gpu(1));
        let kernel = module_with(store_i32_kernel()).kernel("store").unwrap();
        let mut job = launch(kernel, vec![KernelArg::Pointer(8), KernelArg::Int32(1)]);
        job.range = NdRange::from_grid_block([1, 1, 1], [2048, 1, 1]).unwrap();
        assert!(matches!(
            queue.submit(job),
            Err(RuntimeError::InvalidLaunch(_))
        ));
    }

    #[test]
    fn test_suggest_block_size() {
        let queue = open(DeviceInfo::simulated_gpu(1));
        let kernel = module_with(store_i32_kernel()).kernel("store").unwrap();
        assert_eq!(
            queue.suggest_block_size(kernel.as_ref(), &[4096]).unwrap(),
            vec![1024]
        );
        assert_eq!(
            queue.suggest_block_size(kernel.as_ref(), &[100, 64]).unwrap(),
            vec![100, 8]
        );
        assert!(queue.suggest_block_size(kernel.as_ref(), &[]).is_err());
        assert!(queue.suggest_block_size(kernel.as_ref(), &[1, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_largest_divisor() {
        assert_eq!(largest_divisor_at_most(4096, 1024), 1024);
        assert_eq!(largest_divisor_at_most(1000, 256), 250);
        assert_eq!(largest_divisor_at_most(7, 4), 1);
        assert_eq!(largest_divisor_at_most(3, 4), 3);
    }
}
