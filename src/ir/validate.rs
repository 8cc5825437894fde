//! IR validator
//!
//! Invoked between passes as a self-check; any broken invariant is a
//! fatal [`CodegenError`] naming the first violation found.

use crate::error::CodegenError;
use crate::ir::context::IrContext;
use crate::ir::inst::InstKind;
use crate::ir::value::{ValueId, ValueType};

use std::collections::{BTreeMap, BTreeSet};

/// Check every function in the context.
pub fn validate(ctx: &IrContext) -> Result<(), CodegenError> {
    for &func in &ctx.functions {
        validate_function(ctx, func)?;
    }
    Ok(())
}

fn fail(ctx: &IrContext, func: ValueId, message: &str) -> CodegenError {
    let name = ctx.value(func).name.as_deref().unwrap_or("?");
    CodegenError::new(format!("invalid IR in {}: {}", name, message))
}

fn validate_function(ctx: &IrContext, func: ValueId) -> Result<(), CodegenError> {
    let data = ctx.value(func).function();
    let blocks = data.blocks.clone();

    // Exactly one terminator per block, in last position.
    for &block in &blocks {
        let insts = &ctx.value(block).block().insts;
        match insts.last() {
            Some(&last) if ctx.inst(last).kind.is_terminator() => {}
            _ => return Err(fail(ctx, func, "block is not terminated")),
        }
        for &inst in &insts[..insts.len() - 1] {
            if ctx.inst(inst).kind.is_terminator() {
                return Err(fail(ctx, func, "terminator in the middle of a block"));
            }
        }
    }

    // Locals are manipulated with load and store only, and are never
    // defined.
    for &local in &data.locals {
        if ctx.value(local).def.is_some() {
            return Err(fail(ctx, func, "local has a defining instruction"));
        }
        for &use_site in &ctx.value(local).uses {
            let slot_use = match ctx.inst(use_site).kind {
                InstKind::Load { src, .. } => src == local,
                InstKind::Store { dest, .. } => dest == local,
                _ => false,
            };
            if !slot_use {
                return Err(fail(ctx, func, "local has a non-load/store use"));
            }
        }
    }

    // Temporaries are defined exactly once.
    let mut def_counts: BTreeMap<ValueId, usize> = BTreeMap::new();
    for &block in &blocks {
        for &inst in &ctx.value(block).block().insts {
            if let Some(dest) = ctx.inst(inst).kind.dest() {
                *def_counts.entry(dest).or_insert(0) += 1;
            }
        }
    }
    for &temp in &data.temps {
        match def_counts.get(&temp) {
            None => {
                return Err(fail(ctx, func, "temporary has no definition"));
            }
            Some(1) => {}
            Some(_) => {
                return Err(fail(ctx, func, "temporary defined more than once"));
            }
        }
    }

    // Predecessor and successor links agree.
    for &block in &blocks {
        for succ in ctx.successors(block) {
            if !ctx.value(succ).block().preds.contains(&block) {
                return Err(fail(ctx, func, "successor does not list its predecessor"));
            }
        }
        for &pred in &ctx.value(block).block().preds {
            if !ctx.successors(pred).contains(&block) {
                return Err(fail(ctx, func, "predecessor does not list its successor"));
            }
        }
    }

    // Unreachable blocks must say so.
    let mut reached = BTreeSet::new();
    let mut worklist = vec![blocks[0]];
    while let Some(block) = worklist.pop() {
        if !reached.insert(block) {
            continue;
        }
        worklist.extend(ctx.successors(block));
    }
    for &block in &blocks {
        if reached.contains(&block) {
            continue;
        }
        let last = *ctx.value(block).block().insts.last().unwrap();
        if !matches!(ctx.inst(last).kind, InstKind::Unreachable) {
            return Err(fail(ctx, func, "unreachable block lacks an Unreachable terminator"));
        }
    }

    // Phi arity matches the predecessor count; every operand is
    // resolved and names a real predecessor.
    for &block in &blocks {
        let preds = &ctx.value(block).block().preds;
        for &inst in &ctx.value(block).block().insts {
            if let InstKind::Phi { sources, .. } = &ctx.inst(inst).kind {
                if sources.len() != preds.len() {
                    return Err(fail(ctx, func, "phi arity differs from predecessor count"));
                }
                for (pred, value) in sources {
                    if value.is_none() {
                        return Err(fail(ctx, func, "phi has an unresolved operand"));
                    }
                    if !preds.contains(pred) {
                        return Err(fail(ctx, func, "phi names a non-predecessor block"));
                    }
                }
            }
        }
    }

    // Operand type agreement, promoted from source assertions.
    for &block in &blocks {
        for &inst in &ctx.value(block).block().insts {
            match &ctx.inst(inst).kind {
                InstKind::BinaryOp { dest, lhs, rhs, .. } => {
                    let lt = ctx.value(*lhs).ty;
                    let rt = ctx.value(*rhs).ty;
                    let dt = ctx.value(*dest).ty;
                    if !lt.is_integer() || lt != rt || dt != lt {
                        return Err(fail(ctx, func, "binary operation with mismatched types"));
                    }
                }
                InstKind::ConditionalJump { lhs, rhs, .. } => {
                    if ctx.value(*lhs).ty != ctx.value(*rhs).ty {
                        return Err(fail(ctx, func, "comparison with mismatched types"));
                    }
                }
                InstKind::Tag { dest, src } => {
                    if ctx.value(*dest).ty != ValueType::BoxOrInt
                        || !ctx.value(*src).ty.is_integer()
                    {
                        return Err(fail(ctx, func, "tag with mismatched types"));
                    }
                }
                InstKind::Untag { dest, src } => {
                    if !ctx.value(*dest).ty.is_integer()
                        || ctx.value(*src).ty != ValueType::BoxOrInt
                    {
                        return Err(fail(ctx, func, "untag with mismatched types"));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}
