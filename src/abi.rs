//! C ABI surface
//!
//! The entry points called by compiled code. Handles are opaque pointers:
//! - Stream: `Arc::into_raw` of an [`Arc<Stream>`]; the Arc count is the
//!   stream's reference count
//! - Module / Kernel: boxed handles, freed by their `destroy` call
//! - Event: a pooled [`EventCell`]
//!
//! No error or panic crosses the boundary. A failing call logs the error
//! and aborts the process. With recoverable errors enabled (the
//! `DGPU_RECOVERABLE_ERRORS` switch or [`dgpu_set_recoverable_errors`]) it
//! stores the error for [`dgpu_last_error`] and returns null (or nothing)
//! instead.
//! Event and parameter arrays are sentinel-terminated; a null array is an
//! empty list.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_void};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use crate::config::{self, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::event_pool::{EventCell, EventHandle};
use crate::module::{Kernel, Module};
use crate::param::{
    self, AllocType, GpuAllocResult, GpuParamDesc, MAX_EVENT_DEPS, MAX_KERNEL_PARAMS,
};
use crate::stream::Stream;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

static RECOVERABLE_ERRORS: AtomicBool = AtomicBool::new(false);

fn recoverable_errors() -> bool {
    RECOVERABLE_ERRORS.load(Ordering::Relaxed) || RuntimeConfig::global().recoverable_errors
}

fn set_last_error(message: String) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn ensure_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        config::init_logging(&RuntimeConfig::global().log_filter);
    });
}

/// Prints entry/exit lines when call logging is enabled
struct CallScope {
    name: &'static str,
    enabled: bool,
}

impl CallScope {
    fn enter(name: &'static str) -> Self {
        let enabled = RuntimeConfig::global().log_calls;
        if enabled {
            println!("{} enter", name);
            std::io::stdout().flush().ok();
        }
        Self { name, enabled }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if self.enabled {
            println!("{} exit", self.name);
            std::io::stdout().flush().ok();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Record a failed call, or abort when errors are not recoverable
fn fail<T>(name: &'static str, message: String, default: T) -> T {
    if !recoverable_errors() {
        eprintln!("dgpu: fatal error in {}: {}", name, message);
        std::process::abort();
    }
    set_last_error(message);
    default
}

/// Run one entry point body, turning errors and panics into `default`
fn catch_all<T>(name: &'static str, default: T, body: impl FnOnce() -> Result<T>) -> T {
    ensure_logging();
    let _scope = CallScope::enter(name);
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            tracing::error!(entry = name, %err, "runtime call failed");
            fail(name, err.to_string(), default)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(entry = name, panic = %message, "runtime call panicked");
            fail(name, format!("internal error: {}", message), default)
        }
    }
}

/// Owned reference to a stream handle for the duration of one call
unsafe fn stream_ref(stream: *mut Stream) -> Result<Arc<Stream>> {
    if stream.is_null() {
        return Err(RuntimeError::NullHandle("stream"));
    }
    unsafe {
        Arc::increment_strong_count(stream);
        Ok(Arc::from_raw(stream))
    }
}

unsafe fn handle_ref<'a, T>(handle: *mut T, what: &'static str) -> Result<&'a T> {
    unsafe { handle.as_ref() }.ok_or(RuntimeError::NullHandle(what))
}

fn event_handle(event: *mut EventCell) -> Result<EventHandle> {
    NonNull::new(event).ok_or(RuntimeError::NullHandle("event"))
}

unsafe fn event_list(events: *const *mut EventCell) -> Result<Vec<EventHandle>> {
    let events = unsafe { param::pointers_until_null(events, MAX_EVENT_DEPS)? };
    Ok(events.iter().copied().filter_map(NonNull::new).collect())
}

unsafe fn c_str<'a>(s: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
    (!s.is_null()).then(|| unsafe { CStr::from_ptr(s) }.to_string_lossy())
}

/// Create a stream on the device matched by `device_name` (null or empty:
/// any device).
///
/// # Safety
///
/// `device_name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_stream_create(device_name: *const c_char) -> *mut Stream {
    catch_all("dgpu_stream_create", ptr::null_mut(), || {
        let selector = unsafe { c_str(device_name) }.unwrap_or_default();
        let stream = Stream::create(&selector)?;
        Ok(Arc::into_raw(stream).cast_mut())
    })
}

/// Release the caller's stream reference
///
/// # Safety
///
/// `stream` must be a handle from [`dgpu_stream_create`] whose reference has
/// not been released yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_stream_destroy(stream: *mut Stream) {
    catch_all("dgpu_stream_destroy", (), || {
        if stream.is_null() {
            return Err(RuntimeError::NullHandle("stream"));
        }
        unsafe { Stream::release(stream) };
        Ok(())
    })
}

/// Load a compiled module
///
/// # Safety
///
/// `stream` must be live; `data` must be readable for `data_size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_module_load(
    stream: *mut Stream,
    data: *const c_void,
    data_size: usize,
) -> *mut Module {
    catch_all("dgpu_module_load", ptr::null_mut(), || {
        let stream = unsafe { stream_ref(stream)? };
        let image: &[u8] = if data.is_null() {
            if data_size != 0 {
                return Err(RuntimeError::NullHandle("module data"));
            }
            &[]
        } else {
            unsafe { slice::from_raw_parts(data.cast::<u8>(), data_size) }
        };
        let module = stream.load_module(image)?;
        Ok(Box::into_raw(Box::new(module)))
    })
}

/// # Safety
///
/// `module` must be a handle from [`dgpu_module_load`], destroyed once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_module_destroy(module: *mut Module) {
    catch_all("dgpu_module_destroy", (), || {
        if module.is_null() {
            return Err(RuntimeError::NullHandle("module"));
        }
        drop(unsafe { Box::from_raw(module) });
        Ok(())
    })
}

/// Resolve a kernel by name
///
/// # Safety
///
/// `module` must be live; `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_kernel_get(module: *mut Module, name: *const c_char) -> *mut Kernel {
    catch_all("dgpu_kernel_get", ptr::null_mut(), || {
        let module = unsafe { handle_ref(module, "module")? };
        let name = unsafe { c_str(name) }.ok_or(RuntimeError::NullHandle("kernel name"))?;
        let kernel = module.kernel(&name)?;
        Ok(Box::into_raw(Box::new(kernel)))
    })
}

/// # Safety
///
/// `kernel` must be a handle from [`dgpu_kernel_get`], destroyed once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_kernel_destroy(kernel: *mut Kernel) {
    catch_all("dgpu_kernel_destroy", (), || {
        if kernel.is_null() {
            return Err(RuntimeError::NullHandle("kernel"));
        }
        drop(unsafe { Box::from_raw(kernel) });
        Ok(())
    })
}

/// Queue a kernel launch after `events` (null-terminated) with `params`
/// (terminated by a `Null` descriptor). Returns the launch's event.
///
/// # Safety
///
/// All handles must be live; both arrays must be null or properly
/// terminated; every descriptor's data must be readable for its size.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_launch_kernel(
    stream: *mut Stream,
    kernel: *mut Kernel,
    grid_x: usize,
    grid_y: usize,
    grid_z: usize,
    block_x: usize,
    block_y: usize,
    block_z: usize,
    events: *const *mut EventCell,
    params: *const GpuParamDesc,
) -> *mut EventCell {
    catch_all("dgpu_launch_kernel", ptr::null_mut(), || {
        let stream = unsafe { stream_ref(stream)? };
        let kernel = unsafe { handle_ref(kernel, "kernel")? };
        let deps = unsafe { event_list(events)? };
        let params = unsafe { param::params_until_sentinel(params, MAX_KERNEL_PARAMS)? };
        let event = unsafe {
            stream.launch_kernel(
                kernel,
                [grid_x, grid_y, grid_z],
                [block_x, block_y, block_z],
                &deps,
                params,
            )?
        };
        Ok(event.as_ptr())
    })
}

/// Block until `event` completes
///
/// # Safety
///
/// `stream` and `event` must be live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_wait(stream: *mut Stream, event: *mut EventCell) {
    catch_all("dgpu_wait", (), || {
        let stream = unsafe { stream_ref(stream)? };
        let event = event_handle(event)?;
        unsafe { stream.wait_event(event) }
    })
}

/// Destroy an event without waiting for it
///
/// # Safety
///
/// `stream` must be live; `event` must be a live event of that stream and is
/// invalid afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_destroy_event(stream: *mut Stream, event: *mut EventCell) {
    catch_all("dgpu_destroy_event", (), || {
        let stream = unsafe { stream_ref(stream)? };
        let event = event_handle(event)?;
        unsafe { stream.destroy_event(event) }
    })
}

/// Allocate a buffer after `events` have completed. A failure aborts; with
/// recoverable errors `result` is left as null pointer and null event.
///
/// # Safety
///
/// `stream` must be live, `events` null or null-terminated, `result` valid
/// for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_alloc(
    stream: *mut Stream,
    size: usize,
    alignment: usize,
    alloc_type: i32,
    events: *const *mut EventCell,
    result: *mut GpuAllocResult,
) {
    catch_all("dgpu_alloc", (), || {
        if result.is_null() {
            return Err(RuntimeError::NullHandle("allocation result"));
        }
        unsafe { result.write(GpuAllocResult::default()) };

        let stream = unsafe { stream_ref(stream)? };
        let kind = AllocType::from_raw(alloc_type)?;
        let deps = unsafe { event_list(events)? };
        let (ptr, event) = unsafe { stream.alloc_buffer(size, alignment, kind, &deps)? };
        unsafe {
            result.write(GpuAllocResult {
                ptr,
                event: event.as_ptr(),
            })
        };
        Ok(())
    })
}

/// Free a buffer from [`dgpu_alloc`] (null is allowed) and release the
/// stream reference it held
///
/// # Safety
///
/// `stream` must be live; `ptr` must come from `dgpu_alloc` on it and not be
/// in use by pending work.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_dealloc(stream: *mut Stream, ptr: *mut c_void) {
    catch_all("dgpu_dealloc", (), || {
        let stream = unsafe { stream_ref(stream)? };
        unsafe { stream.dealloc_buffer(ptr) }
    })
}

/// Write a suggested block size for `grid_size` into `block_size`; both
/// arrays have `num_dims` entries
///
/// # Safety
///
/// Handles must be live; the arrays must hold `num_dims` elements.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dgpu_suggest_block_size(
    stream: *mut Stream,
    kernel: *mut Kernel,
    grid_size: *const u32,
    block_size: *mut u32,
    num_dims: usize,
) {
    catch_all("dgpu_suggest_block_size", (), || {
        let stream = unsafe { stream_ref(stream)? };
        let kernel = unsafe { handle_ref(kernel, "kernel")? };
        if grid_size.is_null() || block_size.is_null() {
            return Err(RuntimeError::NullHandle("block size array"));
        }
        let grid = unsafe { slice::from_raw_parts(grid_size, num_dims) };
        let suggested = stream.suggest_block_size(kernel, grid)?;
        let out = unsafe { slice::from_raw_parts_mut(block_size, num_dims) };
        out.copy_from_slice(&suggested);
        Ok(())
    })
}

/// Non-zero makes failed calls return null and record their error for
/// [`dgpu_last_error`] instead of aborting; zero restores the environment
/// setting.
#[unsafe(no_mangle)]
pub extern "C" fn dgpu_set_recoverable_errors(enabled: i32) {
    RECOVERABLE_ERRORS.store(enabled != 0, Ordering::Relaxed);
}

/// Message of the calling thread's last failed call, or null. The string
/// stays valid until the next failure on this thread or [`dgpu_clear_error`].
#[unsafe(no_mangle)]
pub extern "C" fn dgpu_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |message| message.as_ptr())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn dgpu_clear_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Last error of this thread as a Rust string
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|message| message.to_string_lossy().into_owned())
    })
}
