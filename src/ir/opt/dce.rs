//! Dead-value elimination

use crate::ir::context::IrContext;
use crate::ir::inst::InstKind;
use crate::ir::value::ValueId;

use tracing::debug;

/// Delete every defining instruction whose result is unused and which
/// has no observable side effect, iterating to a fixpoint. Returns
/// whether anything was removed.
pub fn kill_dead_values(ctx: &mut IrContext, func: ValueId) -> bool {
    let mut removed = 0usize;

    loop {
        let mut changed = false;
        let blocks = ctx.value(func).function().blocks.clone();

        for block in blocks {
            let insts = ctx.value(block).block().insts.clone();
            for inst in insts {
                if ctx.inst(inst).dead {
                    continue;
                }
                let pure = matches!(
                    ctx.inst(inst).kind,
                    InstKind::BinaryOp { .. }
                        | InstKind::Copy { .. }
                        | InstKind::IndexedLoad { .. }
                        | InstKind::Load { .. }
                        | InstKind::Phi { .. }
                        | InstKind::Tag { .. }
                        | InstKind::Untag { .. }
                );
                if !pure {
                    continue;
                }
                let dest = ctx.inst(inst).kind.dest().expect("pure instruction defines");
                if ctx.value(dest).uses.is_empty() {
                    ctx.remove_inst(inst);
                    ctx.kill_temp(dest);
                    changed = true;
                    removed += 1;
                }
            }
        }

        if !changed {
            break;
        }
    }

    if removed > 0 {
        debug!(removed, "killed dead values");
    }
    removed > 0
}
