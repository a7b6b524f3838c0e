//! Structural verification of decoded modules
//!
//! Catches the problems that would otherwise only show up mid-execution:
//! dangling block references, uses of undefined values, sparse value ids,
//! out-of-range parameters and oversized or unknown shared memory.

use rustc_hash::FxHashSet;

use super::{GpuKernel, GpuModule, GpuOp, GpuTerminator};
use crate::error::{Result, RuntimeError};

pub fn verify_module(module: &GpuModule) -> Result<()> {
    for (name, kernel) in &module.kernels {
        if name != &kernel.name {
            return Err(RuntimeError::malformed(format!(
                "kernel registered as `{}` is named `{}`",
                name, kernel.name
            )));
        }
        verify_kernel(kernel)?;
    }
    Ok(())
}

pub fn verify_kernel(kernel: &GpuKernel) -> Result<()> {
    let fail = |msg: String| RuntimeError::malformed(format!("kernel `{}`: {}", kernel.name, msg));

    if kernel.blocks.is_empty() {
        return Err(fail("has no blocks".to_string()));
    }

    let mut block_ids = FxHashSet::default();
    for block in &kernel.blocks {
        if !block_ids.insert(block.id) {
            return Err(fail(format!("duplicate block {}", block.id)));
        }
    }
    if !block_ids.contains(&kernel.entry) {
        return Err(fail(format!("entry block {} does not exist", kernel.entry)));
    }

    // Value ids index per-item register files, so they must be dense
    let value_count = kernel.instruction_count();
    let mut defined = FxHashSet::default();
    for block in &kernel.blocks {
        for (id, _) in &block.instructions {
            if id.0 as usize >= value_count {
                return Err(fail(format!(
                    "value {} out of range for {} instructions",
                    id, value_count
                )));
            }
            if !defined.insert(*id) {
                return Err(fail(format!("value {} defined twice", id)));
            }
        }
    }

    if kernel.shared_layout().is_none() {
        return Err(fail("static shared memory overflows".to_string()));
    }

    let shared: FxHashSet<&str> = kernel
        .shared_memory
        .iter()
        .map(|d| d.name.as_str())
        .collect();

    for block in &kernel.blocks {
        for (id, op) in &block.instructions {
            for operand in op.operands() {
                if !defined.contains(&operand) {
                    return Err(fail(format!("{} uses undefined value {}", id, operand)));
                }
            }
            match op {
                GpuOp::Param(index) if *index as usize >= kernel.params.len() => {
                    return Err(fail(format!(
                        "{} reads parameter {} of {}",
                        id,
                        index,
                        kernel.params.len()
                    )));
                }
                GpuOp::SharedAddr(name) if !shared.contains(name.as_str()) => {
                    return Err(fail(format!("unknown shared memory `{}`", name)));
                }
                GpuOp::Phi(incoming) => {
                    if let Some((pred, _)) = incoming.iter().find(|(b, _)| !block_ids.contains(b)) {
                        return Err(fail(format!("phi {} names missing block {}", id, pred)));
                    }
                }
                _ => {}
            }
        }

        if let GpuTerminator::CondBr(cond, _, _) = &block.terminator {
            if !defined.contains(cond) {
                return Err(fail(format!(
                    "branch in {} uses undefined value {}",
                    block.id, cond
                )));
            }
        }
        for target in block.terminator.successors() {
            if !block_ids.contains(&target) {
                return Err(fail(format!(
                    "{} branches to missing block {}",
                    block.id, target
                )));
            }
        }
    }

    Ok(())
}
