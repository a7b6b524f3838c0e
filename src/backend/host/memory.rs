//! Host-side device memory
//!
//! Device and shared allocations of the host backend are ordinary aligned
//! heap blocks. The allocator remembers each block's layout so `free` can be
//! checked, and accounts the bytes in use against the device's memory size.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Result, RuntimeError};
use crate::param::AllocType;

/// Alignment used when the caller passes 0
pub const DEFAULT_ALIGNMENT: usize = 64;

#[derive(Default)]
struct AllocState {
    live: FxHashMap<usize, (Layout, AllocType)>,
    used: u64,
}

pub struct HostAllocator {
    limit: u64,
    state: Mutex<AllocState>,
}

impl HostAllocator {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(AllocState::default()),
        }
    }

    /// Zero-initialized aligned allocation. `None` for empty requests, invalid
    /// alignments and requests exceeding the remaining device memory.
    pub fn alloc(&self, kind: AllocType, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        let layout = Layout::from_size_align(size, alignment).ok()?;

        let mut state = self.state.lock();
        if state.used.saturating_add(size as u64) > self.limit {
            tracing::debug!(size, used = state.used, limit = self.limit, "device memory exhausted");
            return None;
        }

        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        state.live.insert(ptr.as_ptr() as usize, (layout, kind));
        state.used += size as u64;
        Some(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must not be accessed after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state.lock();
        let (layout, _) = state
            .live
            .remove(&addr)
            .ok_or(RuntimeError::UnknownAllocation { addr })?;
        state.used -= layout.size() as u64;
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    pub fn kind_of(&self, addr: usize) -> Option<AllocType> {
        self.state.lock().live.get(&addr).map(|(_, kind)| *kind)
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            tracing::warn!(
                count = state.live.len(),
                bytes = state.used,
                "releasing allocations still live at queue teardown"
            );
        }
        for (addr, (layout, _)) in state.live.drain() {
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let allocator = HostAllocator::new(1024);
        let ptr = allocator.alloc(AllocType::Device, 100, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(allocator.used_bytes(), 100);
        assert_eq!(
            allocator.kind_of(ptr.as_ptr() as usize),
            Some(AllocType::Device)
        );

        unsafe { allocator.free(ptr) }.unwrap();
        assert_eq!(allocator.used_bytes(), 0);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn test_default_alignment() {
        let allocator = HostAllocator::new(1024);
        let ptr = allocator.alloc(AllocType::Shared, 8, 0).unwrap();
        assert_eq!(ptr.as_ptr() as usize % DEFAULT_ALIGNMENT, 0);
        unsafe { allocator.free(ptr) }.unwrap();
    }

    #[test]
    fn test_rejected_requests() {
        let allocator = HostAllocator::new(1024);
        assert!(allocator.alloc(AllocType::Device, 0, 8).is_none());
        assert!(allocator.alloc(AllocType::Device, 16, 3).is_none());
        assert!(allocator.alloc(AllocType::Device, 2048, 8).is_none());
    }

    #[test]
    fn test_limit_accounts_live_bytes() {
        let allocator = HostAllocator::new(100);
        let a = allocator.alloc(AllocType::Device, 60, 8).unwrap();
        assert!(allocator.alloc(AllocType::Device, 60, 8).is_none());
        unsafe { allocator.free(a) }.unwrap();
        let b = allocator.alloc(AllocType::Device, 60, 8).unwrap();
        unsafe { allocator.free(b) }.unwrap();
    }

    #[test]
    fn test_free_unknown_pointer() {
        let allocator = HostAllocator::new(100);
        let mut local = 0u8;
        let err = unsafe { allocator.free(NonNull::from(&mut local)) }.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownAllocation { .. }));
    }
}
