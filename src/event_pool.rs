//! Recyclable event cells
//!
//! Every launch and allocation hands the caller an [`EventHandle`]: a stable
//! pointer to a heap cell holding the backend event and a reference to the
//! stream that issued it. Destroyed cells go back to the stream's free list
//! and are reused by later submissions.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::DeviceEvent;
use crate::stream::Stream;

/// Opaque event handle passed across the ABI
pub type EventHandle = NonNull<EventCell>;

/// Storage behind an [`EventHandle`]
#[derive(Default)]
pub struct EventCell {
    event: Option<DeviceEvent>,
    owner: Option<Arc<Stream>>,
}

impl EventCell {
    /// The tracked operation; `None` only while a submission is in progress
    pub fn event(&self) -> Option<&DeviceEvent> {
        self.event.as_ref()
    }

    pub fn is_owned_by(&self, stream: &Stream) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(owner), stream))
    }
}

/// Free list of event cells
#[derive(Default)]
pub struct EventPool {
    free: Mutex<Vec<Box<EventCell>>>,
    allocated: AtomicUsize,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a recycled cell (or a new one) and bind it to `owner`. The cell
    /// holds the owner reference until it is released.
    pub fn acquire(&self, owner: Arc<Stream>) -> EventHandle {
        let mut cell = self.free.lock().pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Box::default()
        });
        cell.owner = Some(owner);
        NonNull::from(Box::leak(cell))
    }

    /// Return a cell to the free list. The owner reference is handed back so
    /// the caller can drop it after the list lock is released.
    ///
    /// # Safety
    ///
    /// `handle` must come from [`acquire`](Self::acquire) on this pool and
    /// must not have been released already.
    pub unsafe fn release(&self, handle: EventHandle) -> Option<Arc<Stream>> {
        let mut cell = unsafe { Box::from_raw(handle.as_ptr()) };
        cell.event = None;
        let owner = cell.owner.take();
        self.free.lock().push(cell);
        owner
    }

    /// Cells currently on the free list
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// Cells allocated over the pool's lifetime
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// A cell acquired for a submission that has not been committed yet.
/// Dropping it without [`commit`](Self::commit) returns the cell and its
/// stream reference.
pub struct PendingEvent<'a> {
    pool: &'a EventPool,
    handle: EventHandle,
    committed: bool,
}

impl<'a> PendingEvent<'a> {
    pub fn new(pool: &'a EventPool, owner: Arc<Stream>) -> Self {
        Self {
            pool,
            handle: pool.acquire(owner),
            committed: false,
        }
    }

    /// Attach the submitted operation and hand the handle to the caller
    pub fn commit(mut self, event: DeviceEvent) -> EventHandle {
        // The cell is exclusively ours until the handle is returned
        unsafe { self.handle.as_mut() }.event = Some(event);
        self.committed = true;
        self.handle
    }
}

impl Drop for PendingEvent<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let owner = unsafe { self.pool.release(self.handle) };
            drop(owner);
        }
    }
}
