//! Kernel parameter descriptors and ABI list scanning
//!
//! The compiler passes kernel arguments as a dense array of [`GpuParamDesc`]
//! terminated by a descriptor whose kind is [`ParamType::Null`], and event
//! dependencies as an array of event pointers terminated by null. Both are
//! converted to bounded slices here, before anything else touches them.

use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::event_pool::EventCell;

/// Upper bound on the number of parameters scanned before the sentinel
pub const MAX_KERNEL_PARAMS: usize = 1024;

/// Upper bound on the number of dependency events scanned before the null terminator
pub const MAX_EVENT_DEPS: usize = 4096;

/// Parameter discriminant. Must be kept in sync with the compiler.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Null = 0,
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float32 = 6,
    Float64 = 7,
    Ptr = 8,
}

impl ParamType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => ParamType::Null,
            1 => ParamType::Bool,
            2 => ParamType::Int8,
            3 => ParamType::Int16,
            4 => ParamType::Int32,
            5 => ParamType::Int64,
            6 => ParamType::Float32,
            7 => ParamType::Float64,
            8 => ParamType::Ptr,
            _ => return None,
        })
    }

    /// Size in bytes of the value a descriptor of this kind points at
    pub fn natural_size(self) -> usize {
        match self {
            ParamType::Null => 0,
            ParamType::Bool | ParamType::Int8 => 1,
            ParamType::Int16 => 2,
            ParamType::Int32 | ParamType::Float32 => 4,
            ParamType::Int64 | ParamType::Float64 => 8,
            ParamType::Ptr => size_of::<*const c_void>(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Null => write!(f, "null"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Int8 => write!(f, "int8"),
            ParamType::Int16 => write!(f, "int16"),
            ParamType::Int32 => write!(f, "int32"),
            ParamType::Int64 => write!(f, "int64"),
            ParamType::Float32 => write!(f, "float32"),
            ParamType::Float64 => write!(f, "float64"),
            ParamType::Ptr => write!(f, "ptr"),
        }
    }
}

/// One kernel argument as laid out by the compiler.
///
/// `data` points at the argument value (for `Ptr`, at a variable holding the
/// device pointer). A `Ptr` descriptor with null `data` requests a
/// workgroup-local buffer of `size` bytes instead.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuParamDesc {
    pub data: *const c_void,
    pub size: i32,
    pub kind: i32,
}

impl GpuParamDesc {
    /// List terminator
    pub const SENTINEL: GpuParamDesc = GpuParamDesc {
        data: ptr::null(),
        size: 0,
        kind: ParamType::Null as i32,
    };

    pub fn new(kind: ParamType, data: *const c_void, size: i32) -> Self {
        Self {
            data,
            size,
            kind: kind as i32,
        }
    }

    /// Describe a scalar living at `value`
    pub fn scalar<T: ScalarParam>(value: &T) -> Self {
        Self::new(
            T::KIND,
            value as *const T as *const c_void,
            size_of::<T>() as i32,
        )
    }

    /// Describe a device pointer stored at `slot`
    pub fn pointer(slot: &*mut c_void) -> Self {
        Self::new(
            ParamType::Ptr,
            slot as *const *mut c_void as *const c_void,
            size_of::<*mut c_void>() as i32,
        )
    }

    /// Request `size` bytes of workgroup-local memory
    pub fn local(size: usize) -> Self {
        Self::new(ParamType::Ptr, ptr::null(), size as i32)
    }

    pub fn is_sentinel(&self) -> bool {
        self.kind == ParamType::Null as i32
    }

    pub fn param_type(&self) -> Option<ParamType> {
        ParamType::from_raw(self.kind)
    }
}

/// Scalar types with a fixed descriptor kind
pub trait ScalarParam: Copy {
    const KIND: ParamType;
    fn into_arg(self) -> KernelArg;
}

macro_rules! scalar_param {
    ($ty:ty, $kind:ident, $arg:ident) => {
        impl ScalarParam for $ty {
            const KIND: ParamType = ParamType::$kind;
            fn into_arg(self) -> KernelArg {
                KernelArg::$arg(self)
            }
        }
    };
}

scalar_param!(i8, Int8, Int8);
scalar_param!(i16, Int16, Int16);
scalar_param!(i32, Int32, Int32);
scalar_param!(i64, Int64, Int64);
scalar_param!(f32, Float32, Float32);
scalar_param!(f64, Float64, Float64);

impl ScalarParam for bool {
    const KIND: ParamType = ParamType::Bool;
    fn into_arg(self) -> KernelArg {
        KernelArg::Bool(self)
    }
}

/// A bound kernel argument, owned and ready to cross into the backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Device address
    Pointer(usize),
    /// Workgroup-local buffer of the given size, materialized per group
    LocalMemory(usize),
}

impl KernelArg {
    pub fn param_type(&self) -> ParamType {
        match self {
            KernelArg::Bool(_) => ParamType::Bool,
            KernelArg::Int8(_) => ParamType::Int8,
            KernelArg::Int16(_) => ParamType::Int16,
            KernelArg::Int32(_) => ParamType::Int32,
            KernelArg::Int64(_) => ParamType::Int64,
            KernelArg::Float32(_) => ParamType::Float32,
            KernelArg::Float64(_) => ParamType::Float64,
            KernelArg::Pointer(_) | KernelArg::LocalMemory(_) => ParamType::Ptr,
        }
    }
}

/// Allocation kinds understood by `alloc`
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocType {
    Device = 0,
    Shared = 1,
    Local = 2,
}

impl AllocType {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(AllocType::Device),
            1 => Ok(AllocType::Shared),
            2 => Ok(AllocType::Local),
            other => Err(RuntimeError::InvalidAllocType(other)),
        }
    }
}

impl fmt::Display for AllocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocType::Device => write!(f, "device"),
            AllocType::Shared => write!(f, "shared"),
            AllocType::Local => write!(f, "local"),
        }
    }
}

/// Out-parameter of `dgpu_alloc`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuAllocResult {
    pub ptr: *mut c_void,
    pub event: *mut EventCell,
}

impl Default for GpuAllocResult {
    fn default() -> Self {
        Self {
            ptr: ptr::null_mut(),
            event: ptr::null_mut(),
        }
    }
}

// === Binding ===

type ParamHandler = unsafe fn(usize, &GpuParamDesc) -> Option<Result<KernelArg>>;

/// Tried in order; the first handler whose kind matches wins.
const PARAM_HANDLERS: [ParamHandler; 8] = [
    bind_scalar::<bool>,
    bind_scalar::<i8>,
    bind_scalar::<i16>,
    bind_scalar::<i32>,
    bind_scalar::<i64>,
    bind_scalar::<f32>,
    bind_scalar::<f64>,
    bind_pointer,
];

unsafe fn bind_scalar<T: ScalarParam>(index: usize, desc: &GpuParamDesc) -> Option<Result<KernelArg>> {
    if desc.kind != T::KIND as i32 {
        return None;
    }
    if desc.size as usize != size_of::<T>() || desc.size < 0 {
        return Some(Err(RuntimeError::invalid_param(
            index,
            format!(
                "{} descriptor has size {}, expected {}",
                T::KIND,
                desc.size,
                size_of::<T>()
            ),
        )));
    }
    if desc.data.is_null() {
        return Some(Err(RuntimeError::invalid_param(
            index,
            format!("{} descriptor has no data", T::KIND),
        )));
    }

    // bool is read as a byte so that any non-zero value is accepted
    if T::KIND == ParamType::Bool {
        let byte = unsafe { ptr::read_unaligned(desc.data as *const u8) };
        return Some(Ok(KernelArg::Bool(byte != 0)));
    }
    let value = unsafe { ptr::read_unaligned(desc.data as *const T) };
    Some(Ok(value.into_arg()))
}

unsafe fn bind_pointer(index: usize, desc: &GpuParamDesc) -> Option<Result<KernelArg>> {
    if desc.kind != ParamType::Ptr as i32 {
        return None;
    }
    if desc.data.is_null() {
        if desc.size <= 0 {
            return Some(Err(RuntimeError::invalid_param(
                index,
                format!("local memory request of {} bytes", desc.size),
            )));
        }
        return Some(Ok(KernelArg::LocalMemory(desc.size as usize)));
    }
    if desc.size as usize != size_of::<*const c_void>() {
        return Some(Err(RuntimeError::invalid_param(
            index,
            format!("ptr descriptor has size {}", desc.size),
        )));
    }
    let addr = unsafe { ptr::read_unaligned(desc.data as *const usize) };
    Some(Ok(KernelArg::Pointer(addr)))
}

/// Bind one descriptor. `None` means no handler recognizes its kind.
///
/// # Safety
///
/// A non-null `desc.data` must point to at least `desc.size` readable bytes.
pub unsafe fn bind_param(index: usize, desc: &GpuParamDesc) -> Option<Result<KernelArg>> {
    PARAM_HANDLERS
        .iter()
        .find_map(|handler| unsafe { handler(index, desc) })
}

/// Bind a whole argument list positionally.
///
/// An unrecognized discriminant means compiler and runtime disagree on the
/// argument encoding; the process is aborted.
///
/// # Safety
///
/// Same as [`bind_param`] for every element.
pub unsafe fn bind_params(params: &[GpuParamDesc]) -> Result<Vec<KernelArg>> {
    params
        .iter()
        .enumerate()
        .map(|(index, desc)| match unsafe { bind_param(index, desc) } {
            Some(arg) => arg,
            None => abort_on_abi_skew(index, desc.kind),
        })
        .collect()
}

fn abort_on_abi_skew(index: usize, kind: i32) -> ! {
    tracing::error!(index, kind, "Unhandled param type");
    println!("Unhandled param type: {}", kind);
    use std::io::Write;
    std::io::stdout().flush().ok();
    std::process::abort()
}

// === Sentinel scanning ===

unsafe fn scan_until<'a, T>(
    ptr: *const T,
    limit: usize,
    what: &'static str,
    is_end: impl Fn(&T) -> bool,
) -> Result<&'a [T]> {
    if ptr.is_null() {
        return Ok(&[]);
    }
    for len in 0..=limit {
        if is_end(unsafe { &*ptr.add(len) }) {
            return Ok(unsafe { std::slice::from_raw_parts(ptr, len) });
        }
    }
    Err(RuntimeError::UnterminatedList { what, limit })
}

/// View a sentinel-terminated descriptor array as a slice (sentinel excluded).
/// A null array is an empty list.
///
/// # Safety
///
/// `params` must be null or point to descriptors readable up to the sentinel
/// or `limit + 1` entries, whichever comes first.
pub unsafe fn params_until_sentinel<'a>(
    params: *const GpuParamDesc,
    limit: usize,
) -> Result<&'a [GpuParamDesc]> {
    unsafe { scan_until(params, limit, "parameter", GpuParamDesc::is_sentinel) }
}

/// View a null-terminated pointer array as a slice (terminator excluded).
///
/// # Safety
///
/// As for [`params_until_sentinel`].
pub unsafe fn pointers_until_null<'a, T>(list: *const *mut T, limit: usize) -> Result<&'a [*mut T]> {
    unsafe { scan_until(list, limit, "event", |p: &*mut T| p.is_null()) }
}
