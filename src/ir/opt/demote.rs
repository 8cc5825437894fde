//! Global-to-local demotion

use crate::consts::ENTRY_SYMBOL;
use crate::error::CodegenError;
use crate::ir::context::IrContext;
use crate::ir::value::ValueId;

use tracing::debug;

/// Rewrite every global used only inside the entry function into a
/// fresh local there. Runs before SSA formation so the new locals are
/// renamed like any other.
pub fn demote_globals(ctx: &mut IrContext) -> Result<(), CodegenError> {
    let entry = ctx
        .functions
        .iter()
        .copied()
        .find(|&f| ctx.value(f).name.as_deref() == Some(ENTRY_SYMBOL))
        .ok_or_else(|| CodegenError::new("no entry function in compilation unit"))?;

    let globals = ctx.globals.clone();
    let mut kept = Vec::with_capacity(globals.len());
    let mut demoted = 0usize;

    for global in globals {
        if used_outside(ctx, global, entry) {
            kept.push(global);
            continue;
        }

        let ty = ctx.value(global).ty;
        let name = ctx
            .value(global)
            .name
            .clone()
            .unwrap_or_else(|| "g".to_string());
        let local = ctx.create_local(entry, ty, &name);
        ctx.replace_references(global, local);
        demoted += 1;
    }

    ctx.globals = kept;
    if demoted > 0 {
        debug!(demoted, "demoted globals to locals");
    }
    Ok(())
}

fn used_outside(ctx: &IrContext, variable: ValueId, func: ValueId) -> bool {
    ctx.value(variable).uses.iter().any(|&inst| {
        let block = ctx.inst(inst).parent;
        ctx.value(block).block().parent != func
    })
}
