//! Device streams
//!
//! A [`Stream`] owns one device queue for its whole life and is shared
//! through `Arc`. Besides the caller's own handle, every live event and every
//! allocated buffer holds a reference, so the queue outlives a logical close
//! until the last of them is released.
//!
//! # Example
//!
//! ```ignore
//! let stream = Stream::create("gpu")?;
//! let module = stream.load_module(&bytes)?;
//! let kernel = module.kernel("increment")?;
//! let (buf, ev) = unsafe { stream.alloc_buffer(64, 0, AllocType::Shared, &[])? };
//! let done = unsafe { stream.launch(&kernel, [1, 1, 1], [16, 1, 1], &[ev], args)? };
//! unsafe { stream.wait_event(done)? };
//! ```

use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::backend::selector::select_device;
use crate::backend::{self, Backend, DeviceEvent, DeviceInfo, DeviceQueue, KernelLaunch, NdRange};
use crate::error::{Result, RuntimeError};
use crate::event_pool::{EventHandle, EventPool, PendingEvent};
use crate::module::{Kernel, Module};
use crate::param::{self, AllocType, GpuParamDesc, KernelArg};

/// Command stream bound to one device
pub struct Stream {
    selector: String,
    queue: Box<dyn DeviceQueue>,
    events: EventPool,
}

impl Stream {
    /// Open a stream on the default backend. An empty selector picks the
    /// best available device.
    pub fn create(selector: &str) -> Result<Arc<Self>> {
        Self::with_backend(backend::default_backend().as_ref(), selector)
    }

    /// Open a stream on an explicit backend
    pub fn with_backend(backend: &dyn Backend, selector: &str) -> Result<Arc<Self>> {
        let devices = backend.devices();
        let device = select_device(selector, &devices)?;
        let queue = backend.create_queue(&device)?;

        tracing::debug!(
            selector,
            device = %device.selector(),
            name = %device.name,
            "created stream"
        );
        Ok(Arc::new(Self {
            selector: selector.to_string(),
            queue,
            events: EventPool::new(),
        }))
    }

    /// Selector the stream was created with
    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn device(&self) -> &DeviceInfo {
        self.queue.device()
    }

    pub fn events(&self) -> &EventPool {
        &self.events
    }

    /// Current reference count
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Add one reference to a stream handle
    ///
    /// # Safety
    ///
    /// `stream` must come from `Arc::into_raw` and still be alive.
    pub unsafe fn retain(stream: *const Stream) {
        unsafe { Arc::increment_strong_count(stream) };
    }

    /// Drop one reference; the last one destroys the stream and its queue
    ///
    /// # Safety
    ///
    /// `stream` must come from `Arc::into_raw` and the caller must own the
    /// reference being released.
    pub unsafe fn release(stream: *const Stream) {
        unsafe { Arc::decrement_strong_count(stream) };
    }

    /// Load a compiled module onto this stream's queue
    pub fn load_module(&self, image: &[u8]) -> Result<Module> {
        let inner = self.queue.load_module(image)?;
        tracing::debug!(module = %inner.name(), bytes = image.len(), "loaded module");
        Ok(Module::new(inner))
    }

    /// Launch with raw parameter descriptors
    ///
    /// # Safety
    ///
    /// Every handle in `deps` must be a live event, and every descriptor's
    /// `data` must be valid for `size` bytes.
    pub unsafe fn launch_kernel(
        self: &Arc<Self>,
        kernel: &Kernel,
        grid: [usize; 3],
        block: [usize; 3],
        deps: &[EventHandle],
        params: &[GpuParamDesc],
    ) -> Result<EventHandle> {
        let args = unsafe { param::bind_params(params)? };
        unsafe { self.launch(kernel, grid, block, deps, args) }
    }

    /// Launch `kernel` over `grid` blocks of `block` work-items once every
    /// event in `deps` has completed. Returns as soon as the launch is queued.
    ///
    /// # Safety
    ///
    /// Every handle in `deps` must be a live event.
    pub unsafe fn launch(
        self: &Arc<Self>,
        kernel: &Kernel,
        grid: [usize; 3],
        block: [usize; 3],
        deps: &[EventHandle],
        args: Vec<KernelArg>,
    ) -> Result<EventHandle> {
        let entry = kernel.entry()?;
        let range = NdRange::from_grid_block(grid, block)?;
        let deps = unsafe { collect_events(deps) };

        let pending = PendingEvent::new(&self.events, self.clone());
        let event = self.queue.submit(KernelLaunch {
            kernel: entry,
            range,
            deps,
            args,
        })?;

        tracing::trace!(kernel = kernel.name(), ?grid, ?block, "launched kernel");
        Ok(pending.commit(event))
    }

    /// Allocate a buffer after every event in `deps` has completed. The
    /// returned event is already complete. `Local` allocations return null;
    /// the memory is materialized per work-group at launch time.
    ///
    /// Every successful call retains the stream until the matching
    /// [`dealloc_buffer`](Self::dealloc_buffer).
    ///
    /// # Safety
    ///
    /// Every handle in `deps` must be a live event.
    pub unsafe fn alloc_buffer(
        self: &Arc<Self>,
        size: usize,
        alignment: usize,
        kind: AllocType,
        deps: &[EventHandle],
    ) -> Result<(*mut c_void, EventHandle)> {
        for dep in unsafe { collect_events(deps) } {
            if let Err(err) = dep.wait() {
                tracing::debug!(%err, "allocation predecessor failed");
            }
        }

        let pending = PendingEvent::new(&self.events, self.clone());
        let ptr: *mut c_void = match kind {
            AllocType::Local => ptr::null_mut(),
            AllocType::Device | AllocType::Shared => self
                .queue
                .alloc(kind, size, alignment)
                .ok_or(RuntimeError::AllocationFailed {
                    kind,
                    size,
                    alignment,
                })?
                .as_ptr()
                .cast(),
        };

        // The buffer's own reference, released by `dealloc_buffer`
        unsafe { Arc::increment_strong_count(Arc::as_ptr(self)) };
        tracing::trace!(%kind, size, alignment, ?ptr, "allocated buffer");
        Ok((ptr, pending.commit(DeviceEvent::completed())))
    }

    /// Free a buffer (no-op for null) and drop the reference it held
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc_buffer`](Self::alloc_buffer) on this
    /// stream, must not be freed twice, and no pending work may use it. The
    /// caller must hold its own reference besides the buffer's.
    pub unsafe fn dealloc_buffer(self: &Arc<Self>, ptr: *mut c_void) -> Result<()> {
        if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
            unsafe { self.queue.free(ptr)? };
        }
        unsafe { Arc::decrement_strong_count(Arc::as_ptr(self)) };
        tracing::trace!(?ptr, "released buffer");
        Ok(())
    }

    /// Block until the event's operation has finished
    ///
    /// # Safety
    ///
    /// `event` must be a live event handle.
    pub unsafe fn wait_event(&self, event: EventHandle) -> Result<()> {
        match unsafe { event.as_ref() }.event() {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }

    /// Return an event cell to the free list and drop its stream reference.
    /// Does not wait for the operation.
    ///
    /// # Safety
    ///
    /// `event` must be a live event handle; it is invalid afterwards. The
    /// caller must hold its own reference to this stream.
    pub unsafe fn destroy_event(&self, event: EventHandle) -> Result<()> {
        if !unsafe { event.as_ref() }.is_owned_by(self) {
            return Err(RuntimeError::ForeignEvent);
        }
        let owner = unsafe { self.events.release(event) };
        drop(owner);
        Ok(())
    }

    /// Advisory block size for `grid`, one entry per dimension
    pub fn suggest_block_size(&self, kernel: &Kernel, grid: &[u32]) -> Result<Vec<u32>> {
        let entry = kernel.entry()?;
        self.queue.suggest_block_size(entry.as_ref(), grid)
    }
}

/// Backend events behind a list of handles
///
/// # Safety
///
/// Every handle must be a live event.
unsafe fn collect_events(handles: &[EventHandle]) -> Vec<DeviceEvent> {
    handles
        .iter()
        .filter_map(|h| unsafe { h.as_ref() }.event().cloned())
        .collect()
}

impl Drop for Stream {
    fn drop(&mut self) {
        tracing::debug!(
            selector = %self.selector,
            device = %self.queue.device().selector(),
            recycled_events = self.events.free_len(),
            "destroying stream"
        );
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("selector", &self.selector)
            .field("device", &self.device().selector())
            .finish()
    }
}
