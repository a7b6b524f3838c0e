//! Kernel interpreter for the host backend
//!
//! Work-groups run in parallel on the rayon pool. Inside a group the
//! work-items are stepped in lockstep phases separated by `SyncThreads`:
//! each item runs until it reaches a barrier or returns, then the next phase
//! starts. A group where some items return while others wait at a barrier has
//! diverged and faults.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::backend::NdRange;
use crate::error::{Result as RuntimeResult, RuntimeError};
use crate::ir::{BlockId, GpuKernel, GpuOp, GpuTerminator, GpuType, ValueId};
use crate::param::KernelArg;

/// Execution fault raised inside a work-item
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("null pointer dereference")]
    NullPointer,

    #[error("misaligned atomic access at {addr:#x} (needs {align}-byte alignment)")]
    Misaligned { addr: usize, align: usize },

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("value {0} used before it was defined")]
    Undefined(ValueId),

    #[error("parameter {0} was not supplied")]
    MissingParam(u32),

    #[error("unknown shared memory `{0}`")]
    UnknownShared(String),

    #[error("phi in {block} has no input for predecessor {pred}")]
    MissingPhiInput { block: BlockId, pred: BlockId },

    #[error("phi in {0} is not at the head of its block")]
    MisplacedPhi(BlockId),

    #[error("reached unreachable code in {0}")]
    Unreachable(BlockId),

    #[error("branch to unknown block {0}")]
    UnknownBlock(BlockId),

    #[error("work-items diverged at a barrier")]
    BarrierDivergence,
}

/// Runtime value of one SSA register
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(usize),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Ptr(_) => "ptr",
        }
    }

    fn from_arg(arg: &KernelArg) -> Self {
        match *arg {
            KernelArg::Bool(b) => Value::Bool(b),
            KernelArg::Int8(v) => Value::I8(v),
            KernelArg::Int16(v) => Value::I16(v),
            KernelArg::Int32(v) => Value::I32(v),
            KernelArg::Int64(v) => Value::I64(v),
            KernelArg::Float32(v) => Value::F32(v),
            KernelArg::Float64(v) => Value::F64(v),
            KernelArg::Pointer(addr) => Value::Ptr(addr),
            // Materialized per group by the caller
            KernelArg::LocalMemory(_) => Value::Ptr(0),
        }
    }

    /// Integer view of non-float values
    fn as_i64(self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(b as i64),
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::Ptr(p) => Some(p as i64),
            Value::F32(_) | Value::F64(_) => None,
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            Value::Ptr(_) => None,
            other => other.as_i64().map(|v| v as f64),
        }
    }

    fn as_bool(self) -> Result<bool, Fault> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(Fault::TypeMismatch(format!(
                "expected bool, found {}",
                other.type_name()
            ))),
        }
    }

    fn as_ptr(self) -> Result<usize, Fault> {
        match self {
            Value::Ptr(p) => Ok(p),
            other => Err(Fault::TypeMismatch(format!(
                "expected pointer, found {}",
                other.type_name()
            ))),
        }
    }

    /// Numeric conversion with truncating/saturating `as` semantics
    pub fn cast(self, ty: GpuType) -> Result<Value, Fault> {
        let is_float = matches!(self, Value::F32(_) | Value::F64(_));
        let bad_cast = || Fault::TypeMismatch(format!("cannot cast {} to {}", self.type_name(), ty));
        let int = match self {
            Value::F32(v) => v as i64,
            Value::F64(v) => v as i64,
            other => other.as_i64().unwrap_or(0),
        };

        Ok(match ty {
            GpuType::Bool => Value::Bool(match self {
                Value::F32(v) => v != 0.0,
                Value::F64(v) => v != 0.0,
                _ => int != 0,
            }),
            GpuType::I8 => Value::I8(int as i8),
            GpuType::I16 => Value::I16(int as i16),
            GpuType::I32 => Value::I32(int as i32),
            GpuType::I64 => Value::I64(int),
            GpuType::F32 => Value::F32(self.as_f64().ok_or_else(bad_cast)? as f32),
            GpuType::F64 => Value::F64(self.as_f64().ok_or_else(bad_cast)?),
            GpuType::Ptr(_) if is_float => return Err(bad_cast()),
            GpuType::Ptr(_) => Value::Ptr(int as usize),
        })
    }
}

fn mismatch(what: &str, a: Value, b: Value) -> Fault {
    Fault::TypeMismatch(format!(
        "{} on {} and {}",
        what,
        a.type_name(),
        b.type_name()
    ))
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
}

macro_rules! int_arith {
    ($op:expr, $x:expr, $y:expr) => {
        match $op {
            Arith::Add => $x.wrapping_add($y),
            Arith::Sub => $x.wrapping_sub($y),
            Arith::Mul => $x.wrapping_mul($y),
            Arith::Div => {
                if $y == 0 {
                    return Err(Fault::DivisionByZero);
                }
                $x.wrapping_div($y)
            }
            Arith::Rem => {
                if $y == 0 {
                    return Err(Fault::DivisionByZero);
                }
                $x.wrapping_rem($y)
            }
            Arith::Min => $x.min($y),
            Arith::Max => $x.max($y),
        }
    };
}

macro_rules! float_arith {
    ($op:expr, $x:expr, $y:expr) => {
        match $op {
            Arith::Add => $x + $y,
            Arith::Sub => $x - $y,
            Arith::Mul => $x * $y,
            Arith::Div => $x / $y,
            Arith::Rem => $x % $y,
            Arith::Min => $x.min($y),
            Arith::Max => $x.max($y),
        }
    };
}

fn arith(op: Arith, a: Value, b: Value) -> Result<Value, Fault> {
    Ok(match (a, b) {
        (Value::I8(x), Value::I8(y)) => Value::I8(int_arith!(op, x, y)),
        (Value::I16(x), Value::I16(y)) => Value::I16(int_arith!(op, x, y)),
        (Value::I32(x), Value::I32(y)) => Value::I32(int_arith!(op, x, y)),
        (Value::I64(x), Value::I64(y)) => Value::I64(int_arith!(op, x, y)),
        (Value::Ptr(x), Value::Ptr(y)) => Value::Ptr(int_arith!(op, x, y)),
        (Value::F32(x), Value::F32(y)) => Value::F32(float_arith!(op, x, y)),
        (Value::F64(x), Value::F64(y)) => Value::F64(float_arith!(op, x, y)),
        _ => return Err(mismatch("arithmetic", a, b)),
    })
}

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn apply<T: PartialOrd>(self, x: T, y: T) -> bool {
        match self {
            Cmp::Eq => x == y,
            Cmp::Ne => x != y,
            Cmp::Lt => x < y,
            Cmp::Le => x <= y,
            Cmp::Gt => x > y,
            Cmp::Ge => x >= y,
        }
    }
}

fn compare(op: Cmp, a: Value, b: Value) -> Result<Value, Fault> {
    let result = match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => op.apply(x, y),
        (Value::I8(x), Value::I8(y)) => op.apply(x, y),
        (Value::I16(x), Value::I16(y)) => op.apply(x, y),
        (Value::I32(x), Value::I32(y)) => op.apply(x, y),
        (Value::I64(x), Value::I64(y)) => op.apply(x, y),
        (Value::F32(x), Value::F32(y)) => op.apply(x, y),
        (Value::F64(x), Value::F64(y)) => op.apply(x, y),
        (Value::Ptr(x), Value::Ptr(y)) => op.apply(x, y),
        _ => return Err(mismatch("comparison", a, b)),
    };
    Ok(Value::Bool(result))
}

#[derive(Debug, Clone, Copy)]
enum Bits {
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

macro_rules! int_bits {
    ($op:expr, $x:expr, $y:expr) => {
        match $op {
            Bits::And => $x & $y,
            Bits::Or => $x | $y,
            Bits::Xor => $x ^ $y,
            Bits::Shl => $x.wrapping_shl($y as u32),
            Bits::Shr => $x.wrapping_shr($y as u32),
        }
    };
}

fn bitwise(op: Bits, a: Value, b: Value) -> Result<Value, Fault> {
    Ok(match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => match op {
            Bits::And => Value::Bool(x && y),
            Bits::Or => Value::Bool(x || y),
            Bits::Xor => Value::Bool(x ^ y),
            Bits::Shl | Bits::Shr => return Err(mismatch("shift", a, b)),
        },
        (Value::I8(x), Value::I8(y)) => Value::I8(int_bits!(op, x, y)),
        (Value::I16(x), Value::I16(y)) => Value::I16(int_bits!(op, x, y)),
        (Value::I32(x), Value::I32(y)) => Value::I32(int_bits!(op, x, y)),
        (Value::I64(x), Value::I64(y)) => Value::I64(int_bits!(op, x, y)),
        _ => return Err(mismatch("bitwise operation", a, b)),
    })
}

/// # Safety
///
/// `addr` must be valid for a read of `ty`.
unsafe fn load(addr: usize, ty: GpuType) -> Result<Value, Fault> {
    if addr == 0 {
        return Err(Fault::NullPointer);
    }
    let p = addr as *const u8;
    Ok(unsafe {
        match ty {
            GpuType::Bool => Value::Bool(p.read() != 0),
            GpuType::I8 => Value::I8(p.cast::<i8>().read()),
            GpuType::I16 => Value::I16(p.cast::<i16>().read_unaligned()),
            GpuType::I32 => Value::I32(p.cast::<i32>().read_unaligned()),
            GpuType::I64 => Value::I64(p.cast::<i64>().read_unaligned()),
            GpuType::F32 => Value::F32(p.cast::<f32>().read_unaligned()),
            GpuType::F64 => Value::F64(p.cast::<f64>().read_unaligned()),
            GpuType::Ptr(_) => Value::Ptr(p.cast::<usize>().read_unaligned()),
        }
    })
}

/// # Safety
///
/// `addr` must be valid for a write of `value`.
unsafe fn store(addr: usize, value: Value) -> Result<(), Fault> {
    if addr == 0 {
        return Err(Fault::NullPointer);
    }
    let p = addr as *mut u8;
    unsafe {
        match value {
            Value::Bool(b) => p.write(b as u8),
            Value::I8(v) => p.cast::<i8>().write(v),
            Value::I16(v) => p.cast::<i16>().write_unaligned(v),
            Value::I32(v) => p.cast::<i32>().write_unaligned(v),
            Value::I64(v) => p.cast::<i64>().write_unaligned(v),
            Value::F32(v) => p.cast::<f32>().write_unaligned(v),
            Value::F64(v) => p.cast::<f64>().write_unaligned(v),
            Value::Ptr(v) => p.cast::<usize>().write_unaligned(v),
        }
    }
    Ok(())
}

/// Atomic fetch-add; returns the previous value
///
/// # Safety
///
/// `addr` must be valid for reads and writes of `value`'s type.
unsafe fn atomic_add(addr: usize, value: Value) -> Result<Value, Fault> {
    if addr == 0 {
        return Err(Fault::NullPointer);
    }
    let aligned = |align: usize| {
        if addr % align == 0 {
            Ok(())
        } else {
            Err(Fault::Misaligned { addr, align })
        }
    };

    match value {
        Value::I32(v) => {
            aligned(4)?;
            let cell = unsafe { AtomicI32::from_ptr(addr as *mut i32) };
            Ok(Value::I32(cell.fetch_add(v, Ordering::SeqCst)))
        }
        Value::I64(v) => {
            aligned(8)?;
            let cell = unsafe { AtomicI64::from_ptr(addr as *mut i64) };
            Ok(Value::I64(cell.fetch_add(v, Ordering::SeqCst)))
        }
        Value::F32(v) => {
            aligned(4)?;
            let cell = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
            let old = cell
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                    Some((f32::from_bits(bits) + v).to_bits())
                })
                .unwrap_or_else(|bits| bits);
            Ok(Value::F32(f32::from_bits(old)))
        }
        Value::F64(v) => {
            aligned(8)?;
            let cell = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
            let old = cell
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                    Some((f64::from_bits(bits) + v).to_bits())
                })
                .unwrap_or_else(|bits| bits);
            Ok(Value::F64(f64::from_bits(old)))
        }
        other => Err(Fault::TypeMismatch(format!(
            "atomic add on {}",
            other.type_name()
        ))),
    }
}

/// Split a linear index into coordinates; dimension 2 varies fastest
fn unflatten(linear: usize, dims: [usize; 3]) -> [usize; 3] {
    [
        linear / (dims[1] * dims[2]),
        (linear / dims[2]) % dims[1],
        linear % dims[2],
    ]
}

/// A verified kernel with its lookup tables built
#[derive(Debug)]
pub struct PreparedKernel {
    kernel: GpuKernel,
    block_index: FxHashMap<BlockId, usize>,
    shared_offsets: FxHashMap<String, usize>,
    shared_size: usize,
    value_count: usize,
}

impl PreparedKernel {
    pub fn new(kernel: GpuKernel) -> RuntimeResult<Self> {
        let (offsets, shared_size) = kernel.shared_layout().ok_or_else(|| {
            RuntimeError::malformed(format!("kernel `{}`: static shared memory overflows", kernel.name))
        })?;
        let block_index = kernel
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id, i))
            .collect();
        let shared_offsets = offsets
            .into_iter()
            .map(|(name, offset)| (name, offset as usize))
            .collect();
        let value_count = kernel.value_count();
        if value_count > kernel.instruction_count() {
            return Err(RuntimeError::malformed(format!(
                "kernel `{}`: value ids are not dense",
                kernel.name
            )));
        }
        Ok(Self {
            kernel,
            block_index,
            shared_offsets,
            shared_size: shared_size as usize,
            value_count,
        })
    }

    pub fn kernel(&self) -> &GpuKernel {
        &self.kernel
    }

    /// Static shared memory per group, in bytes
    pub fn shared_size(&self) -> usize {
        self.shared_size
    }

    fn block(&self, id: BlockId) -> Result<usize, Fault> {
        self.block_index
            .get(&id)
            .copied()
            .ok_or(Fault::UnknownBlock(id))
    }

    /// Run every work-group of `range`. Returns the first fault observed.
    pub fn execute(&self, range: &NdRange, args: &[KernelArg]) -> Result<(), Fault> {
        let counts = range.group_counts();
        (0..range.group_total())
            .into_par_iter()
            .try_for_each(|linear| {
                let group = unflatten(linear, counts);
                self.run_group(range, group, args).inspect_err(|fault| {
                    tracing::debug!(kernel = %self.kernel.name, ?group, %fault, "work-group faulted");
                })
            })
    }

    fn run_group(&self, range: &NdRange, group: [usize; 3], args: &[KernelArg]) -> Result<(), Fault> {
        // Group-private buffers; addresses stay fixed while the Vecs are alive
        let mut scratch: Vec<Vec<u64>> = Vec::new();
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                KernelArg::LocalMemory(size) => {
                    let mut buf = vec![0u64; size.div_ceil(8)];
                    let addr = buf.as_mut_ptr() as usize;
                    scratch.push(buf);
                    Value::Ptr(addr)
                }
                other => Value::from_arg(other),
            };
            params.push(value);
        }
        let mut shared = vec![0u64; self.shared_size.div_ceil(8)];

        let ctx = GroupCtx {
            prepared: self,
            range,
            group,
            counts: range.group_counts(),
            params: &params,
            shared_base: shared.as_mut_ptr() as usize,
        };

        let entry = self.block(self.kernel.entry)?;
        let mut items: Vec<Item> = (0..range.group_size())
            .map(|linear| Item {
                local: unflatten(linear, range.local),
                block: entry,
                ip: 0,
                values: vec![None; self.value_count],
                done: false,
            })
            .collect();

        loop {
            let mut waiting = 0;
            for item in items.iter_mut().filter(|i| !i.done) {
                match ctx.run(item)? {
                    Pause::Barrier => waiting += 1,
                    Pause::Returned => item.done = true,
                }
            }
            if waiting == 0 {
                return Ok(());
            }
            if waiting != items.len() {
                return Err(Fault::BarrierDivergence);
            }
        }
    }
}

struct Item {
    local: [usize; 3],
    block: usize,
    ip: usize,
    values: Vec<Option<Value>>,
    done: bool,
}

impl Item {
    fn get(&self, id: ValueId) -> Result<Value, Fault> {
        self.values
            .get(id.0 as usize)
            .copied()
            .flatten()
            .ok_or(Fault::Undefined(id))
    }
}

enum Pause {
    Barrier,
    Returned,
}

struct GroupCtx<'a> {
    prepared: &'a PreparedKernel,
    range: &'a NdRange,
    group: [usize; 3],
    counts: [usize; 3],
    params: &'a [Value],
    shared_base: usize,
}

impl GroupCtx<'_> {
    /// Step one work-item until it reaches a barrier or returns
    fn run(&self, item: &mut Item) -> Result<Pause, Fault> {
        let blocks = &self.prepared.kernel.blocks;
        loop {
            let block = &blocks[item.block];
            while let Some((id, op)) = block.instructions.get(item.ip) {
                item.ip += 1;
                if matches!(op, GpuOp::SyncThreads) {
                    return Ok(Pause::Barrier);
                }
                if let Some(value) = self.eval(item, block.id, op)? {
                    item.values[id.0 as usize] = Some(value);
                }
            }

            let target = match &block.terminator {
                GpuTerminator::Br(target) => *target,
                GpuTerminator::CondBr(cond, then_block, else_block) => {
                    if item.get(*cond)?.as_bool()? {
                        *then_block
                    } else {
                        *else_block
                    }
                }
                GpuTerminator::ReturnVoid => return Ok(Pause::Returned),
                GpuTerminator::Unreachable => return Err(Fault::Unreachable(block.id)),
            };
            self.enter(item, block.id, target)?;
        }
    }

    /// Move to `target`, resolving its leading phis against `from`
    fn enter(&self, item: &mut Item, from: BlockId, target: BlockId) -> Result<(), Fault> {
        let index = self.prepared.block(target)?;
        let block = &self.prepared.kernel.blocks[index];

        let mut incoming = Vec::new();
        for (id, op) in &block.instructions {
            let GpuOp::Phi(inputs) = op else { break };
            let (_, source) = inputs
                .iter()
                .find(|(pred, _)| *pred == from)
                .ok_or(Fault::MissingPhiInput {
                    block: target,
                    pred: from,
                })?;
            incoming.push((*id, item.get(*source)?));
        }

        item.ip = incoming.len();
        for (id, value) in incoming {
            item.values[id.0 as usize] = Some(value);
        }
        item.block = index;
        Ok(())
    }

    fn eval(&self, item: &Item, block: BlockId, op: &GpuOp) -> Result<Option<Value>, Fault> {
        let get = |id: &ValueId| item.get(*id);
        let dim = |values: [usize; 3], axis: usize| Value::I64(values[2 - axis] as i64);

        let value = match op {
            GpuOp::ConstInt(v, ty) => Value::I64(*v).cast(*ty)?,
            GpuOp::ConstFloat(v, ty) => Value::F64(*v).cast(*ty)?,
            GpuOp::ConstBool(b) => Value::Bool(*b),

            GpuOp::Add(a, b) => arith(Arith::Add, get(a)?, get(b)?)?,
            GpuOp::Sub(a, b) => arith(Arith::Sub, get(a)?, get(b)?)?,
            GpuOp::Mul(a, b) => arith(Arith::Mul, get(a)?, get(b)?)?,
            GpuOp::Div(a, b) => arith(Arith::Div, get(a)?, get(b)?)?,
            GpuOp::Rem(a, b) => arith(Arith::Rem, get(a)?, get(b)?)?,
            GpuOp::Min(a, b) => arith(Arith::Min, get(a)?, get(b)?)?,
            GpuOp::Max(a, b) => arith(Arith::Max, get(a)?, get(b)?)?,
            GpuOp::Neg(a) => match get(a)? {
                Value::I8(v) => Value::I8(v.wrapping_neg()),
                Value::I16(v) => Value::I16(v.wrapping_neg()),
                Value::I32(v) => Value::I32(v.wrapping_neg()),
                Value::I64(v) => Value::I64(v.wrapping_neg()),
                Value::F32(v) => Value::F32(-v),
                Value::F64(v) => Value::F64(-v),
                other => {
                    return Err(Fault::TypeMismatch(format!(
                        "negation of {}",
                        other.type_name()
                    )));
                }
            },

            GpuOp::Eq(a, b) => compare(Cmp::Eq, get(a)?, get(b)?)?,
            GpuOp::Ne(a, b) => compare(Cmp::Ne, get(a)?, get(b)?)?,
            GpuOp::Lt(a, b) => compare(Cmp::Lt, get(a)?, get(b)?)?,
            GpuOp::Le(a, b) => compare(Cmp::Le, get(a)?, get(b)?)?,
            GpuOp::Gt(a, b) => compare(Cmp::Gt, get(a)?, get(b)?)?,
            GpuOp::Ge(a, b) => compare(Cmp::Ge, get(a)?, get(b)?)?,

            GpuOp::And(a, b) => bitwise(Bits::And, get(a)?, get(b)?)?,
            GpuOp::Or(a, b) => bitwise(Bits::Or, get(a)?, get(b)?)?,
            GpuOp::Xor(a, b) => bitwise(Bits::Xor, get(a)?, get(b)?)?,
            GpuOp::Shl(a, b) => bitwise(Bits::Shl, get(a)?, get(b)?)?,
            GpuOp::Shr(a, b) => bitwise(Bits::Shr, get(a)?, get(b)?)?,
            GpuOp::Not(a) => match get(a)? {
                Value::Bool(v) => Value::Bool(!v),
                Value::I8(v) => Value::I8(!v),
                Value::I16(v) => Value::I16(!v),
                Value::I32(v) => Value::I32(!v),
                Value::I64(v) => Value::I64(!v),
                other => {
                    return Err(Fault::TypeMismatch(format!(
                        "bitwise not of {}",
                        other.type_name()
                    )));
                }
            },

            GpuOp::Cast(a, ty) => get(a)?.cast(*ty)?,

            GpuOp::Load(ptr, ty) => unsafe { load(get(ptr)?.as_ptr()?, *ty)? },
            GpuOp::Store(ptr, value) => {
                unsafe { store(get(ptr)?.as_ptr()?, get(value)?)? };
                return Ok(None);
            }
            GpuOp::AtomicAdd(ptr, value) => unsafe { atomic_add(get(ptr)?.as_ptr()?, get(value)?)? },

            GpuOp::GetElementPtr(base, index, elem) => {
                let base = get(base)?.as_ptr()?;
                let index = get(index)?;
                let index = index.as_i64().ok_or_else(|| {
                    Fault::TypeMismatch(format!("element index of type {}", index.type_name()))
                })?;
                let offset = index.wrapping_mul(elem.size_bytes() as i64);
                Value::Ptr(base.wrapping_add_signed(offset as isize))
            }

            GpuOp::ThreadIdX => dim(item.local, 0),
            GpuOp::ThreadIdY => dim(item.local, 1),
            GpuOp::ThreadIdZ => dim(item.local, 2),
            GpuOp::BlockIdX => dim(self.group, 0),
            GpuOp::BlockIdY => dim(self.group, 1),
            GpuOp::BlockIdZ => dim(self.group, 2),
            GpuOp::BlockDimX => dim(self.range.local, 0),
            GpuOp::BlockDimY => dim(self.range.local, 1),
            GpuOp::BlockDimZ => dim(self.range.local, 2),
            GpuOp::GridDimX => dim(self.counts, 0),
            GpuOp::GridDimY => dim(self.counts, 1),
            GpuOp::GridDimZ => dim(self.counts, 2),

            // Handled by the stepping loop
            GpuOp::SyncThreads => return Ok(None),

            GpuOp::Phi(_) => return Err(Fault::MisplacedPhi(block)),
            GpuOp::Select(cond, t, f) => {
                if get(cond)?.as_bool()? {
                    get(t)?
                } else {
                    get(f)?
                }
            }

            GpuOp::Param(index) => self
                .params
                .get(*index as usize)
                .copied()
                .ok_or(Fault::MissingParam(*index))?,

            GpuOp::SharedAddr(name) => {
                let offset = self
                    .prepared
                    .shared_offsets
                    .get(name)
                    .ok_or_else(|| Fault::UnknownShared(name.clone()))?;
                Value::Ptr(self.shared_base + offset)
            }
        };
        Ok(Some(value))
    }
}
