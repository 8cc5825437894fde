//! SSA destruction
//!
//! Every phi becomes explicit copies at the tail of its predecessors.
//! Critical edges (source with several successors into a target with
//! several predecessors) are split first, so a copy never executes on
//! a path that bypasses the join.

use crate::ir::context::IrContext;
use crate::ir::inst::InstKind;
use crate::ir::value::ValueId;

use std::collections::BTreeMap;

/// Replace the phis of `func` with copies in its predecessors.
pub fn from_ssa(ctx: &mut IrContext, func: ValueId) {
    let blocks = ctx.value(func).function().blocks.clone();

    for block in blocks {
        let phis: Vec<_> = ctx
            .value(block)
            .block()
            .insts
            .iter()
            .copied()
            .take_while(|&i| matches!(ctx.inst(i).kind, InstKind::Phi { .. }))
            .collect();
        if phis.is_empty() {
            continue;
        }

        // Split critical edges once per predecessor, not per phi.
        let preds = ctx.value(block).block().preds.clone();
        let mut edge_block: BTreeMap<ValueId, ValueId> = BTreeMap::new();
        for &pred in &preds {
            let critical = preds.len() >= 2 && ctx.successors(pred).len() >= 2;
            if critical {
                let split = ctx.create_block(func);
                ctx.append_inst(split, InstKind::Jump { target: block });
                ctx.retarget(pred, block, split);
                edge_block.insert(pred, split);
            } else {
                edge_block.insert(pred, pred);
            }
        }

        for phi in phis {
            let InstKind::Phi { dest, sources } = ctx.inst(phi).kind.clone() else {
                unreachable!()
            };
            ctx.remove_inst(phi);

            for (pred, value) in sources {
                let value = value.expect("unresolved phi operand survived SSA formation");
                let at = edge_block[&pred];
                ctx.insert_before_terminator(at, InstKind::Copy { dest, src: value });
            }
        }
    }
}
