//! Kernel Intermediate Representation
//!
//! The executable form consumed by the host backend. A [`GpuModule`] is what
//! the compiler ships inside a module binary (see [`binary`]); it captures:
//! - Typed kernel parameters
//! - Static workgroup (shared) memory
//! - SSA basic blocks with GPU intrinsics and barriers

pub mod binary;
pub mod verify;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// GPU module containing kernels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuModule {
    /// Module name
    pub name: String,

    /// Kernel functions, in declaration order
    pub kernels: IndexMap<String, GpuKernel>,
}

/// GPU kernel function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuKernel {
    /// Kernel name
    pub name: String,

    /// Parameters
    pub params: Vec<GpuParam>,

    /// Shared memory declarations
    #[serde(default)]
    pub shared_memory: Vec<SharedMemDecl>,

    /// Basic blocks
    pub blocks: Vec<GpuBlock>,

    /// Entry block
    pub entry: BlockId,

    /// Maximum threads per block (optional hint)
    #[serde(default)]
    pub max_threads: Option<u32>,
}

/// GPU parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuParam {
    /// Parameter name
    pub name: String,

    /// Parameter type
    pub ty: GpuType,
}

/// GPU type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr(MemorySpace),
}

impl GpuType {
    pub fn size_bytes(&self) -> u32 {
        match self {
            GpuType::Bool | GpuType::I8 => 1,
            GpuType::I16 => 2,
            GpuType::I32 | GpuType::F32 => 4,
            GpuType::I64 | GpuType::F64 | GpuType::Ptr(_) => 8,
        }
    }

    pub fn alignment(&self) -> u32 {
        self.size_bytes()
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, GpuType::F32 | GpuType::F64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            GpuType::I8 | GpuType::I16 | GpuType::I32 | GpuType::I64
        )
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, GpuType::Ptr(_))
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuType::Bool => write!(f, "bool"),
            GpuType::I8 => write!(f, "i8"),
            GpuType::I16 => write!(f, "i16"),
            GpuType::I32 => write!(f, "i32"),
            GpuType::I64 => write!(f, "i64"),
            GpuType::F32 => write!(f, "f32"),
            GpuType::F64 => write!(f, "f64"),
            GpuType::Ptr(space) => write!(f, "ptr<{}>", space),
        }
    }
}

/// Memory space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    /// Device memory visible to every work-item
    Global,

    /// Workgroup memory, one copy per group
    Shared,

    /// Either of the above
    Generic,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Global => write!(f, "global"),
            MemorySpace::Shared => write!(f, "shared"),
            MemorySpace::Generic => write!(f, "generic"),
        }
    }
}

/// Shared memory declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemDecl {
    /// Variable name
    pub name: String,

    /// Element type
    pub elem_type: GpuType,

    /// Number of elements
    pub size: u32,
}

/// Block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

/// Value identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// GPU basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuBlock {
    /// Block ID
    pub id: BlockId,

    /// Block label
    #[serde(default)]
    pub label: String,

    /// Instructions
    pub instructions: Vec<(ValueId, GpuOp)>,

    /// Terminator
    pub terminator: GpuTerminator,
}

/// GPU operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuOp {
    // === Constants ===
    ConstInt(i64, GpuType),
    ConstFloat(f64, GpuType),
    ConstBool(bool),

    // === Arithmetic (integer or float, by operand type) ===
    Add(ValueId, ValueId),
    Sub(ValueId, ValueId),
    Mul(ValueId, ValueId),
    Div(ValueId, ValueId),
    Rem(ValueId, ValueId),
    Neg(ValueId),
    Min(ValueId, ValueId),
    Max(ValueId, ValueId),

    // === Comparisons ===
    Eq(ValueId, ValueId),
    Ne(ValueId, ValueId),
    Lt(ValueId, ValueId),
    Le(ValueId, ValueId),
    Gt(ValueId, ValueId),
    Ge(ValueId, ValueId),

    // === Logical / bitwise ===
    And(ValueId, ValueId),
    Or(ValueId, ValueId),
    Xor(ValueId, ValueId),
    Not(ValueId),
    Shl(ValueId, ValueId),
    Shr(ValueId, ValueId), // Arithmetic

    // === Conversions ===
    Cast(ValueId, GpuType),

    // === Memory ===
    Load(ValueId, GpuType),
    Store(ValueId, ValueId), // ptr, value
    AtomicAdd(ValueId, ValueId),

    // === Address computation ===
    GetElementPtr(ValueId, ValueId, GpuType), // base, index, element type

    // === GPU Intrinsics ===
    ThreadIdX,
    ThreadIdY,
    ThreadIdZ,
    BlockIdX,
    BlockIdY,
    BlockIdZ,
    BlockDimX,
    BlockDimY,
    BlockDimZ,
    GridDimX,
    GridDimY,
    GridDimZ,

    // === Synchronization ===
    SyncThreads, // Block-level barrier

    // === Control flow ===
    Phi(Vec<(BlockId, ValueId)>),
    Select(ValueId, ValueId, ValueId), // cond, true, false

    // === Parameter ===
    Param(u32),

    // === Shared memory ===
    SharedAddr(String), // Get address of shared memory variable
}

impl GpuOp {
    /// Values read by this operation
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            GpuOp::Add(a, b)
            | GpuOp::Sub(a, b)
            | GpuOp::Mul(a, b)
            | GpuOp::Div(a, b)
            | GpuOp::Rem(a, b)
            | GpuOp::Min(a, b)
            | GpuOp::Max(a, b)
            | GpuOp::Eq(a, b)
            | GpuOp::Ne(a, b)
            | GpuOp::Lt(a, b)
            | GpuOp::Le(a, b)
            | GpuOp::Gt(a, b)
            | GpuOp::Ge(a, b)
            | GpuOp::And(a, b)
            | GpuOp::Or(a, b)
            | GpuOp::Xor(a, b)
            | GpuOp::Shl(a, b)
            | GpuOp::Shr(a, b)
            | GpuOp::Store(a, b)
            | GpuOp::AtomicAdd(a, b)
            | GpuOp::GetElementPtr(a, b, _) => vec![*a, *b],
            GpuOp::Neg(a) | GpuOp::Not(a) | GpuOp::Cast(a, _) | GpuOp::Load(a, _) => vec![*a],
            GpuOp::Select(c, t, f) => vec![*c, *t, *f],
            GpuOp::Phi(incoming) => incoming.iter().map(|(_, v)| *v).collect(),
            _ => Vec::new(),
        }
    }
}

/// GPU terminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuTerminator {
    /// Unconditional branch
    Br(BlockId),

    /// Conditional branch
    CondBr(ValueId, BlockId, BlockId),

    /// Return from kernel
    ReturnVoid,

    /// Unreachable (after divergent exit)
    Unreachable,
}

impl GpuTerminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            GpuTerminator::Br(target) => vec![*target],
            GpuTerminator::CondBr(_, then_block, else_block) => vec![*then_block, *else_block],
            GpuTerminator::ReturnVoid | GpuTerminator::Unreachable => Vec::new(),
        }
    }
}

impl GpuModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: IndexMap::new(),
        }
    }

    pub fn add_kernel(&mut self, kernel: GpuKernel) {
        self.kernels.insert(kernel.name.clone(), kernel);
    }

    pub fn kernel(&self, name: &str) -> Option<&GpuKernel> {
        self.kernels.get(name)
    }
}

impl GpuKernel {
    /// Create a new empty kernel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            shared_memory: Vec::new(),
            blocks: Vec::new(),
            entry: BlockId(0),
            max_threads: None,
        }
    }

    /// Add a parameter to the kernel
    pub fn add_param(&mut self, name: impl Into<String>, ty: GpuType) {
        self.params.push(GpuParam {
            name: name.into(),
            ty,
        });
    }

    /// Add a shared memory declaration
    pub fn add_shared_memory(&mut self, name: impl Into<String>, elem_type: GpuType, size: u32) {
        self.shared_memory.push(SharedMemDecl {
            name: name.into(),
            elem_type,
            size,
        });
    }

    /// Add a basic block
    pub fn add_block(&mut self, block: GpuBlock) {
        self.blocks.push(block);
    }

    /// Get the number of parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Required static shared memory (bytes), each declaration aligned to its
    /// element. `None` if the total does not fit in a `u32`.
    pub fn shared_mem_size(&self) -> Option<u32> {
        self.shared_layout().map(|(_, total)| total)
    }

    /// Byte offset of every shared declaration and the total size, or `None`
    /// when the layout overflows
    pub fn shared_layout(&self) -> Option<(Vec<(String, u32)>, u32)> {
        let mut offset = 0u32;
        let mut offsets = Vec::with_capacity(self.shared_memory.len());
        for decl in &self.shared_memory {
            let align = decl.elem_type.alignment();
            offset = offset.div_ceil(align).checked_mul(align)?;
            offsets.push((decl.name.clone(), offset));
            let bytes = decl.elem_type.size_bytes().checked_mul(decl.size)?;
            offset = offset.checked_add(bytes)?;
        }
        Some((offsets, offset))
    }

    /// Total number of instructions across all blocks
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// One past the highest value id defined in the kernel
    pub fn value_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|(id, _)| id.0 as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

impl GpuBlock {
    /// Create a new empty block
    pub fn new(id: BlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            instructions: Vec::new(),
            terminator: GpuTerminator::Unreachable,
        }
    }

    /// Add an instruction to the block
    pub fn add_instruction(&mut self, value_id: ValueId, op: GpuOp) {
        self.instructions.push((value_id, op));
    }

    /// Set the terminator for the block
    pub fn set_terminator(&mut self, terminator: GpuTerminator) {
        self.terminator = terminator;
    }
}

/// Builder for a single kernel: hands out value/block ids and appends to the
/// current block
pub struct KernelBuilder {
    kernel: GpuKernel,
    current: usize,
    next_value_id: u32,
    next_block_id: u32,
}

impl KernelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut kernel = GpuKernel::new(name);
        kernel.add_block(GpuBlock::new(BlockId(0), "entry"));
        Self {
            kernel,
            current: 0,
            next_value_id: 0,
            next_block_id: 1,
        }
    }

    pub fn param(&mut self, name: impl Into<String>, ty: GpuType) -> ValueId {
        let index = self.kernel.params.len() as u32;
        self.kernel.add_param(name, ty);
        self.op(GpuOp::Param(index))
    }

    pub fn shared(&mut self, name: impl Into<String>, elem_type: GpuType, size: u32) -> ValueId {
        let name = name.into();
        self.kernel.add_shared_memory(name.clone(), elem_type, size);
        self.op(GpuOp::SharedAddr(name))
    }

    pub fn max_threads(&mut self, max: u32) -> &mut Self {
        self.kernel.max_threads = Some(max);
        self
    }

    /// Append an operation to the current block
    pub fn op(&mut self, op: GpuOp) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.kernel.blocks[self.current].add_instruction(id, op);
        id
    }

    /// Create a new (empty) block without switching to it
    pub fn block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.kernel.add_block(GpuBlock::new(id, label));
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        if let Some(index) = self.kernel.blocks.iter().position(|b| b.id == block) {
            self.current = index;
        }
    }

    pub fn terminate(&mut self, terminator: GpuTerminator) {
        self.kernel.blocks[self.current].set_terminator(terminator);
    }

    /// `block_id.x * block_dim.x + thread_id.x`
    pub fn global_id_x(&mut self) -> ValueId {
        let block = self.op(GpuOp::BlockIdX);
        let dim = self.op(GpuOp::BlockDimX);
        let base = self.op(GpuOp::Mul(block, dim));
        let thread = self.op(GpuOp::ThreadIdX);
        self.op(GpuOp::Add(base, thread))
    }

    pub fn build(self) -> GpuKernel {
        self.kernel
    }
}
