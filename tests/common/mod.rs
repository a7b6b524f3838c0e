//! Shared kernel builders for the integration tests

#![allow(dead_code)]

use dgpu_runtime::ir::{GpuKernel, GpuModule, GpuOp, GpuTerminator, GpuType, KernelBuilder, MemorySpace};

pub const GLOBAL_PTR: GpuType = GpuType::Ptr(MemorySpace::Global);

/// `data[gid] += 1` for `gid < n`
pub fn increment_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("increment");
    let data = b.param("data", GLOBAL_PTR);
    let n = b.param("n", GpuType::I32);
    let gid = b.global_id_x();
    let n64 = b.op(GpuOp::Cast(n, GpuType::I64));
    let in_range = b.op(GpuOp::Lt(gid, n64));

    let body = b.block("body");
    let exit = b.block("exit");
    b.terminate(GpuTerminator::CondBr(in_range, body, exit));

    b.switch_to(body);
    let slot = b.op(GpuOp::GetElementPtr(data, gid, GpuType::I32));
    let old = b.op(GpuOp::Load(slot, GpuType::I32));
    let one = b.op(GpuOp::ConstInt(1, GpuType::I32));
    let new = b.op(GpuOp::Add(old, one));
    b.op(GpuOp::Store(slot, new));
    b.terminate(GpuTerminator::Br(exit));

    b.switch_to(exit);
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// `out[gid] = value` for every work-item
pub fn fill_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("fill");
    let out = b.param("out", GLOBAL_PTR);
    let value = b.param("value", GpuType::F32);
    let gid = b.global_id_x();
    let slot = b.op(GpuOp::GetElementPtr(out, gid, GpuType::F32));
    b.op(GpuOp::Store(slot, value));
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// Reverses each block's slice of `data` through a local scratch buffer
pub fn reverse_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("reverse");
    let data = b.param("data", GLOBAL_PTR);
    let scratch = b.param("scratch", GpuType::Ptr(MemorySpace::Shared));
    let gid = b.global_id_x();
    let tid = b.op(GpuOp::ThreadIdX);
    let dim = b.op(GpuOp::BlockDimX);

    let src = b.op(GpuOp::GetElementPtr(data, gid, GpuType::I32));
    let value = b.op(GpuOp::Load(src, GpuType::I32));
    let tmp = b.op(GpuOp::GetElementPtr(scratch, tid, GpuType::I32));
    b.op(GpuOp::Store(tmp, value));
    b.op(GpuOp::SyncThreads);

    let one = b.op(GpuOp::ConstInt(1, GpuType::I64));
    let last = b.op(GpuOp::Sub(dim, one));
    let mirror = b.op(GpuOp::Sub(last, tid));
    let from = b.op(GpuOp::GetElementPtr(scratch, mirror, GpuType::I32));
    let swapped = b.op(GpuOp::Load(from, GpuType::I32));
    b.op(GpuOp::Store(src, swapped));
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// Divides by its argument, faulting on zero
pub fn divide_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("divide");
    let out = b.param("out", GLOBAL_PTR);
    let d = b.param("d", GpuType::I32);
    let ten = b.op(GpuOp::ConstInt(10, GpuType::I32));
    let q = b.op(GpuOp::Div(ten, d));
    b.op(GpuOp::Store(out, q));
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// Takes no arguments and does nothing
pub fn noop_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("noop");
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// Counts `out[gid]` up to `spins` one step at a time, then stores `value`
pub fn slow_fill_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("slow_fill");
    let out = b.param("out", GLOBAL_PTR);
    let value = b.param("value", GpuType::I32);
    let spins = b.param("spins", GpuType::I32);
    let gid = b.global_id_x();
    let slot = b.op(GpuOp::GetElementPtr(out, gid, GpuType::I32));
    let zero = b.op(GpuOp::ConstInt(0, GpuType::I32));
    let one = b.op(GpuOp::ConstInt(1, GpuType::I32));
    b.op(GpuOp::Store(slot, zero));

    let head = b.block("head");
    let body = b.block("body");
    let exit = b.block("exit");
    b.terminate(GpuTerminator::Br(head));

    b.switch_to(head);
    let count = b.op(GpuOp::Load(slot, GpuType::I32));
    let more = b.op(GpuOp::Lt(count, spins));
    b.terminate(GpuTerminator::CondBr(more, body, exit));

    b.switch_to(body);
    let next = b.op(GpuOp::Add(count, one));
    b.op(GpuOp::Store(slot, next));
    b.terminate(GpuTerminator::Br(head));

    b.switch_to(exit);
    b.op(GpuOp::Store(slot, value));
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

/// `dst[gid] = src[gid]`
pub fn copy_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new("copy");
    let dst = b.param("dst", GLOBAL_PTR);
    let src = b.param("src", GLOBAL_PTR);
    let gid = b.global_id_x();
    let from = b.op(GpuOp::GetElementPtr(src, gid, GpuType::I32));
    let value = b.op(GpuOp::Load(from, GpuType::I32));
    let to = b.op(GpuOp::GetElementPtr(dst, gid, GpuType::I32));
    b.op(GpuOp::Store(to, value));
    b.terminate(GpuTerminator::ReturnVoid);
    b.build()
}

pub fn test_module() -> GpuModule {
    let mut module = GpuModule::new("kernels");
    module.add_kernel(increment_kernel());
    module.add_kernel(fill_kernel());
    module.add_kernel(reverse_kernel());
    module.add_kernel(divide_kernel());
    module.add_kernel(noop_kernel());
    module.add_kernel(slow_fill_kernel());
    module.add_kernel(copy_kernel());
    module
}

/// Binary image of [`test_module`]
pub fn module_bytes() -> Vec<u8> {
    test_module().to_binary().expect("encoding failed")
}
