//! The compilation pipeline
//!
//! Passes run strictly in order, each mutating the shared IR in
//! place: TAC construction, global demotion, SSA formation, the
//! optimizer loop, SSA destruction, machine lowering, register
//! allocation, and redundant-move elimination. The validator runs
//! between phases when enabled.

use crate::ast::Program;
use crate::error::CompileError;
use crate::ir::{build, from_ssa, opt, ssa, validate, IrContext};
use crate::machine::{allocate, eliminate_redundant_moves, lower_module, MachineModule};

use tracing::debug;

/// Pipeline switches. Both default on; turning `validate` off skips
/// the between-pass self-checks only.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub optimize: bool,
    pub validate: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            optimize: true,
            validate: true,
        }
    }
}

/// Compile a type-checked program down to allocated machine IR.
pub fn compile(program: &Program) -> Result<MachineModule, CompileError> {
    compile_with(program, &CompileOptions::default())
}

pub fn compile_with(
    program: &Program,
    options: &CompileOptions,
) -> Result<MachineModule, CompileError> {
    let mut ctx = build_ssa(program, options)?;

    let functions = ctx.functions.clone();
    for func in functions {
        from_ssa::from_ssa(&mut ctx, func);
    }

    let mut module = lower_module(&ctx)?;
    for f in &mut module.functions {
        allocate(f);
        eliminate_redundant_moves(f);
    }

    debug!(functions = module.functions.len(), "compilation finished");
    Ok(module)
}

/// Run the middle end only: TAC, demotion, SSA, and the optimizer
/// loop. The returned context is in SSA form.
pub fn build_ssa(program: &Program, options: &CompileOptions) -> Result<IrContext, CompileError> {
    let mut ctx = IrContext::new();
    build::build(program, &mut ctx)?;
    if options.validate {
        validate::validate(&ctx)?;
    }

    // Demotion must precede SSA formation so the fresh locals are
    // renamed like any other.
    opt::demote_globals(&mut ctx)?;

    let functions = ctx.functions.clone();
    for &func in &functions {
        ssa::to_ssa(&mut ctx, func);
    }
    if options.validate {
        validate::validate(&ctx)?;
    }

    if options.optimize {
        for &func in &functions {
            loop {
                let folded = opt::fold_constants(&mut ctx, func)?;
                let killed = opt::kill_dead_values(&mut ctx, func);
                if !folded && !killed {
                    break;
                }
            }
        }
        if options.validate {
            validate::validate(&ctx)?;
        }
    }

    Ok(ctx)
}
