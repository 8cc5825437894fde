//! Redundant-move elimination

use crate::machine::inst::{MachineFunction, MachineOperand, Opcode};

use tracing::debug;

/// Delete every `MOV` whose source and destination were assigned the
/// same hardware register at the same width. Runs after allocation.
pub fn eliminate_redundant_moves(f: &mut MachineFunction) {
    let mut removed = 0usize;

    for block in &mut f.blocks {
        block.insts.retain(|inst| {
            if inst.opcode != Opcode::MovRd {
                return true;
            }
            let (
                Some(MachineOperand::Hreg { reg: dst, ty: dst_ty }),
                Some(MachineOperand::Hreg { reg: src, ty: src_ty }),
            ) = (inst.outputs.first(), inst.inputs.first())
            else {
                return true;
            };
            let redundant = dst == src && dst_ty.bits() == src_ty.bits();
            if redundant {
                removed += 1;
            }
            !redundant
        });
    }

    if removed > 0 {
        debug!(function = %f.name, removed, "eliminated redundant moves");
    }
}
