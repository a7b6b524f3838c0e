//! Stream lifetime, events, allocation and launch tests

mod common;

use std::ffi::c_void;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use dgpu_runtime::backend::host::HostBackend;
use dgpu_runtime::{AllocType, DeviceType, GpuParamDesc, Kernel, Module, RuntimeError, Stream};

fn open(backend: &HostBackend) -> Arc<Stream> {
    Stream::with_backend(backend, "").expect("stream creation failed")
}

/// The module is returned too; its kernels stop launching once it is dropped
fn kernel(stream: &Stream, name: &str) -> (Module, Kernel) {
    let module = stream
        .load_module(&common::module_bytes())
        .expect("module load failed");
    let kernel = module.kernel(name).expect("kernel lookup failed");
    (module, kernel)
}

/// Zeroed shared buffer of `count` i32 values
fn shared_i32(stream: &Arc<Stream>, count: usize) -> *mut i32 {
    let (ptr, event) = unsafe {
        stream
            .alloc_buffer(count * 4, 0, AllocType::Shared, &[])
            .expect("allocation failed")
    };
    unsafe { stream.destroy_event(event).expect("destroy failed") };
    ptr.cast()
}

fn read_i32(ptr: *mut i32, count: usize) -> Vec<i32> {
    unsafe { std::slice::from_raw_parts(ptr, count) }.to_vec()
}

fn assert_no_leaked_events(stream: &Stream) {
    assert_eq!(stream.events().free_len(), stream.events().allocated());
}

// === Device selection ===

#[test]
fn test_empty_selector_prefers_gpu() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    assert_eq!(stream.device().device_type, DeviceType::Gpu);
    assert_eq!(stream.selector(), "");
}

#[test]
fn test_selector_picks_cpu() {
    let backend = HostBackend::new();
    let stream = Stream::with_backend(&backend, "host:cpu").unwrap();
    assert_eq!(stream.device().device_type, DeviceType::Cpu);
}

#[test]
fn test_unmatched_selector() {
    let backend = HostBackend::new();
    let err = Stream::with_backend(&backend, "host:cpu:5").unwrap_err();
    assert!(matches!(err, RuntimeError::DeviceNotFound { .. }));
    assert_eq!(backend.live_queues(), 0);
}

// === Reference counting ===

#[test]
fn test_refcount_tracks_events_and_buffers() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, fill) = kernel(&stream, "fill");
    assert_eq!(stream.ref_count(), 1);

    let mut buffers = Vec::new();
    for _ in 0..3 {
        let (ptr, event) = unsafe { stream.alloc_buffer(64, 0, AllocType::Device, &[]).unwrap() };
        unsafe { stream.destroy_event(event).unwrap() };
        buffers.push(ptr);
    }
    assert_eq!(stream.ref_count(), 4);

    let out = buffers[0];
    let value = 1.5f32;
    let params = [GpuParamDesc::pointer(&out), GpuParamDesc::scalar(&value)];
    let events: Vec<_> = (0..2)
        .map(|_| unsafe {
            stream
                .launch_kernel(&fill, [1, 1, 1], [16, 1, 1], &[], &params)
                .unwrap()
        })
        .collect();
    assert_eq!(stream.ref_count(), 6);

    for event in events {
        unsafe {
            stream.wait_event(event).unwrap();
            stream.destroy_event(event).unwrap();
        }
    }
    assert_eq!(stream.ref_count(), 4);

    for ptr in buffers {
        unsafe { stream.dealloc_buffer(ptr).unwrap() };
    }
    assert_eq!(stream.ref_count(), 1);
    assert_eq!(backend.live_queues(), 1);

    drop(stream);
    assert_eq!(backend.live_queues(), 0);
}

#[test]
fn test_buffer_keeps_stream_alive() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let ptr = shared_i32(&stream, 4);
    let raw = Arc::as_ptr(&stream);

    // The caller's handle goes away first
    drop(stream);
    assert_eq!(backend.live_queues(), 1);

    unsafe {
        Stream::retain(raw);
        let stream = Arc::from_raw(raw);
        stream.dealloc_buffer(ptr.cast()).unwrap();
        assert_eq!(stream.ref_count(), 1);
    }
    assert_eq!(backend.live_queues(), 0);
}

#[test]
fn test_event_keeps_stream_alive() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_, event) = unsafe { stream.alloc_buffer(0, 0, AllocType::Local, &[]).unwrap() };
    let raw = Arc::as_ptr(&stream);
    drop(stream);
    assert_eq!(backend.live_queues(), 1);

    unsafe {
        Stream::retain(raw);
        let stream = Arc::from_raw(raw);
        stream.destroy_event(event).unwrap();
        stream.dealloc_buffer(std::ptr::null_mut()).unwrap();
    }
    assert_eq!(backend.live_queues(), 0);
}

// === Allocation ===

#[test]
fn test_local_alloc_is_null_and_complete() {
    let backend = HostBackend::new();
    let stream = open(&backend);

    let (ptr, event) = unsafe { stream.alloc_buffer(256, 0, AllocType::Local, &[]).unwrap() };
    assert!(ptr.is_null());
    let cell = unsafe { event.as_ref() };
    assert!(cell.event().unwrap().is_complete());
    assert!(cell.is_owned_by(&stream));
    assert_eq!(stream.ref_count(), 3);

    unsafe {
        stream.destroy_event(event).unwrap();
        stream.dealloc_buffer(ptr).unwrap();
    }
    assert_eq!(stream.ref_count(), 1);
}

#[test]
fn test_alloc_failures_leave_no_trace() {
    let backend = HostBackend::new();
    let stream = open(&backend);

    let cases = [
        (0, 0),       // empty
        (1 << 50, 0), // more than the device has
        (64, 3),      // alignment not a power of two
    ];
    for (size, alignment) in cases {
        let err = unsafe {
            stream
                .alloc_buffer(size, alignment, AllocType::Device, &[])
                .unwrap_err()
        };
        assert!(
            matches!(err, RuntimeError::AllocationFailed { .. }),
            "size {} alignment {}: {:?}",
            size,
            alignment,
            err
        );
    }
    assert_eq!(stream.ref_count(), 1);
    assert_no_leaked_events(&stream);
}

#[test]
fn test_alignment_is_honored() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (ptr, event) = unsafe { stream.alloc_buffer(10, 256, AllocType::Device, &[]).unwrap() };
    assert_eq!(ptr as usize % 256, 0);
    unsafe {
        stream.destroy_event(event).unwrap();
        stream.dealloc_buffer(ptr).unwrap();
    }
}

#[test]
fn test_dealloc_unknown_pointer() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let mut local = 0u64;
    let err = unsafe {
        stream
            .dealloc_buffer(&mut local as *mut u64 as *mut c_void)
            .unwrap_err()
    };
    assert!(matches!(err, RuntimeError::UnknownAllocation { .. }));
    assert_eq!(stream.ref_count(), 1);
}

// === Launch ===

#[test]
fn test_increment_end_to_end() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, increment) = kernel(&stream, "increment");

    let (ptr, alloc_event) = unsafe { stream.alloc_buffer(64, 0, AllocType::Shared, &[]).unwrap() };
    let n = 16i32;
    let params = [GpuParamDesc::pointer(&ptr), GpuParamDesc::scalar(&n)];
    let done = unsafe {
        stream
            .launch_kernel(&increment, [2, 1, 1], [8, 1, 1], &[alloc_event], &params)
            .unwrap()
    };
    unsafe { stream.wait_event(done).unwrap() };
    assert_eq!(read_i32(ptr.cast(), 16), vec![1; 16]);

    unsafe {
        stream.destroy_event(done).unwrap();
        stream.destroy_event(alloc_event).unwrap();
        stream.dealloc_buffer(ptr).unwrap();
    }
    assert_eq!(stream.ref_count(), 1);
}

#[test]
fn test_bounds_check_skips_tail() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, increment) = kernel(&stream, "increment");
    let data = shared_i32(&stream, 16);

    let slot: *mut c_void = data.cast();
    let n = 10i32;
    let params = [GpuParamDesc::pointer(&slot), GpuParamDesc::scalar(&n)];
    let done = unsafe {
        stream
            .launch_kernel(&increment, [2, 1, 1], [8, 1, 1], &[], &params)
            .unwrap()
    };
    unsafe { stream.wait_event(done).unwrap() };

    let mut expected = vec![1; 10];
    expected.extend([0; 6]);
    assert_eq!(read_i32(data, 16), expected);
}

#[test]
fn test_chained_launches_run_in_order() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, increment) = kernel(&stream, "increment");
    let data = shared_i32(&stream, 32);

    let slot: *mut c_void = data.cast();
    let n = 32i32;
    let params = [GpuParamDesc::pointer(&slot), GpuParamDesc::scalar(&n)];

    let mut previous = Vec::new();
    let mut all = Vec::new();
    for _ in 0..5 {
        let event = unsafe {
            stream
                .launch_kernel(&increment, [4, 1, 1], [8, 1, 1], &previous, &params)
                .unwrap()
        };
        previous = vec![event];
        all.push(event);
    }
    unsafe { stream.wait_event(previous[0]).unwrap() };
    assert_eq!(read_i32(data, 32), vec![5; 32]);

    for event in all {
        unsafe { stream.destroy_event(event).unwrap() };
    }
    assert_no_leaked_events(&stream);
}

#[test]
fn test_local_memory_argument() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, reverse) = kernel(&stream, "reverse");
    let data = shared_i32(&stream, 8);
    for i in 0..8 {
        unsafe { data.add(i).write(i as i32) };
    }

    let slot: *mut c_void = data.cast();
    let params = [GpuParamDesc::pointer(&slot), GpuParamDesc::local(4 * 4)];
    let done = unsafe {
        stream
            .launch_kernel(&reverse, [2, 1, 1], [4, 1, 1], &[], &params)
            .unwrap()
    };
    unsafe { stream.wait_event(done).unwrap() };
    assert_eq!(read_i32(data, 8), vec![3, 2, 1, 0, 7, 6, 5, 4]);
}

#[test]
fn test_failed_kernel_poisons_successors() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, divide) = kernel(&stream, "divide");
    let (_module, increment) = kernel(&stream, "increment");
    let out = shared_i32(&stream, 1);

    let slot: *mut c_void = out.cast();
    let zero = 0i32;
    let params = [GpuParamDesc::pointer(&slot), GpuParamDesc::scalar(&zero)];
    let failed = unsafe {
        stream
            .launch_kernel(&divide, [1, 1, 1], [1, 1, 1], &[], &params)
            .unwrap()
    };
    let err = unsafe { stream.wait_event(failed).unwrap_err() };
    assert!(err.to_string().contains("division by zero"), "{}", err);

    let n = 1i32;
    let params = [GpuParamDesc::pointer(&slot), GpuParamDesc::scalar(&n)];
    let next = unsafe {
        stream
            .launch_kernel(&increment, [1, 1, 1], [1, 1, 1], &[failed], &params)
            .unwrap()
    };
    let err = unsafe { stream.wait_event(next).unwrap_err() };
    assert!(err.to_string().contains("predecessor failed"), "{}", err);
    assert_eq!(read_i32(out, 1), vec![0]);
}

#[test]
fn test_rejected_launch_returns_event_cell() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, increment) = kernel(&stream, "increment");

    let n = 1i32;
    let err = unsafe {
        stream
            .launch_kernel(
                &increment,
                [1, 1, 1],
                [1, 1, 1],
                &[],
                &[GpuParamDesc::scalar(&n)],
            )
            .unwrap_err()
    };
    assert!(matches!(err, RuntimeError::ParamMismatch { .. }));
    assert_eq!(stream.ref_count(), 1);
    assert_no_leaked_events(&stream);
}

#[test]
fn test_oversized_block_is_rejected() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, noop) = kernel(&stream, "noop");

    let err = unsafe {
        stream
            .launch(&noop, [1, 1, 1], [1 << 33, 1 << 33, 1], &[], Vec::new())
            .unwrap_err()
    };
    assert!(matches!(err, RuntimeError::InvalidLaunch(_)), "{}", err);
    assert_eq!(stream.ref_count(), 1);
    assert_no_leaked_events(&stream);
}

#[test]
fn test_launch_after_module_destroyed() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let module = stream.load_module(&common::module_bytes()).unwrap();
    let fill = module.kernel("fill").unwrap();
    drop(module);

    assert!(!fill.is_live());
    let err = unsafe {
        stream
            .launch(&fill, [1, 1, 1], [1, 1, 1], &[], Vec::new())
            .unwrap_err()
    };
    assert_eq!(
        err,
        RuntimeError::ModuleDestroyed {
            kernel: "fill".to_string()
        }
    );
    assert_eq!(stream.ref_count(), 1);
}

// === Events ===

#[test]
fn test_events_are_recycled() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    for _ in 0..10 {
        let (_, event) = unsafe { stream.alloc_buffer(0, 0, AllocType::Local, &[]).unwrap() };
        unsafe {
            stream.destroy_event(event).unwrap();
            stream.dealloc_buffer(std::ptr::null_mut()).unwrap();
        }
    }
    assert_eq!(stream.events().allocated(), 1);
    assert_eq!(stream.events().free_len(), 1);
}

#[test]
fn test_foreign_event_rejected() {
    let backend = HostBackend::new();
    let a = open(&backend);
    let b = open(&backend);

    let (_, event) = unsafe { a.alloc_buffer(0, 0, AllocType::Local, &[]).unwrap() };
    let err = unsafe { b.destroy_event(event).unwrap_err() };
    assert_eq!(err, RuntimeError::ForeignEvent);

    unsafe {
        a.destroy_event(event).unwrap();
        a.dealloc_buffer(std::ptr::null_mut()).unwrap();
    }
    assert_eq!(a.ref_count(), 1);
    assert_eq!(b.ref_count(), 1);
}

#[test]
fn test_cross_stream_dependency() {
    let backend = HostBackend::new();
    let a = open(&backend);
    let b = open(&backend);
    let (_module, slow_fill) = kernel(&a, "slow_fill");
    let (_module, copy) = kernel(&b, "copy");
    let src = shared_i32(&a, 16);
    let dst = shared_i32(&b, 16);

    let src_slot: *mut c_void = src.cast();
    let dst_slot: *mut c_void = dst.cast();
    let spins = 2_000i32;
    for round in 0..20i32 {
        let value = round + 100;
        let fill_params = [
            GpuParamDesc::pointer(&src_slot),
            GpuParamDesc::scalar(&value),
            GpuParamDesc::scalar(&spins),
        ];
        let copy_params = [GpuParamDesc::pointer(&dst_slot), GpuParamDesc::pointer(&src_slot)];
        let filled = unsafe {
            a.launch_kernel(&slow_fill, [2, 1, 1], [8, 1, 1], &[], &fill_params)
                .unwrap()
        };
        // The copy must not start until the slow writer on the other queue is done
        let copied = unsafe {
            b.launch_kernel(&copy, [2, 1, 1], [8, 1, 1], &[filled], &copy_params)
                .unwrap()
        };
        unsafe { b.wait_event(copied).unwrap() };
        assert_eq!(read_i32(dst, 16), vec![value; 16], "round {}", round);

        unsafe {
            b.destroy_event(copied).unwrap();
            a.destroy_event(filled).unwrap();
        }
    }
    assert_no_leaked_events(&a);
    assert_no_leaked_events(&b);
}

#[test]
fn test_suggest_block_size() {
    let backend = HostBackend::new();
    let stream = open(&backend);
    let (_module, fill) = kernel(&stream, "fill");
    assert_eq!(stream.suggest_block_size(&fill, &[4096]).unwrap(), vec![1024]);
    assert_eq!(stream.suggest_block_size(&fill, &[100, 64]).unwrap(), vec![100, 8]);
}
