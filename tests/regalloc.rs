//! Register allocation and move elimination over hand-built machine
//! functions.

use ember_codegen::ir::ValueType;
use ember_codegen::machine::{
    allocate, eliminate_redundant_moves, HwReg, MachineFunction, MachineInst, MachineOperand,
    Opcode, RegSet, VregId,
};

fn imm(value: i64) -> MachineOperand {
    MachineOperand::Imm {
        value,
        ty: ValueType::U64,
    }
}

fn vreg(id: VregId) -> MachineOperand {
    MachineOperand::Vreg(id)
}

fn inst(opcode: Opcode, outputs: Vec<MachineOperand>, inputs: Vec<MachineOperand>) -> MachineInst {
    MachineInst {
        opcode,
        outputs,
        inputs,
    }
}

/// A function shell with the standard prologue in place.
fn function_with_prologue() -> (MachineFunction, usize) {
    let mut f = MachineFunction::new("test");
    let block = f.create_block(0);
    let vrsp = f.create_precolored(HwReg::Rsp, ValueType::U64);
    let vrbp = f.create_precolored(HwReg::Rbp, ValueType::U64);
    f.blocks[block.index()]
        .insts
        .push(inst(Opcode::Push, vec![], vec![vreg(vrbp)]));
    f.blocks[block.index()]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(vrbp)], vec![vreg(vrsp)]));
    (f, block.index())
}

fn assigned_regs(f: &MachineFunction) -> Vec<HwReg> {
    let mut out = Vec::new();
    for block in &f.blocks {
        for i in &block.insts {
            for operand in i.outputs.iter().chain(&i.inputs) {
                assert!(
                    !matches!(operand, MachineOperand::Vreg(_)),
                    "virtual register left after allocation: {}",
                    i
                );
                if let MachineOperand::Hreg { reg, .. } = operand {
                    out.push(*reg);
                }
            }
        }
    }
    out
}

#[test]
fn interfering_registers_get_different_colors() {
    let (mut f, b) = function_with_prologue();
    let v1 = f.create_vreg(ValueType::U64);
    let v2 = f.create_vreg(ValueType::U64);
    let v3 = f.create_vreg(ValueType::U64);

    f.blocks[b].insts.push(inst(Opcode::MovRd, vec![vreg(v1)], vec![imm(1)]));
    f.blocks[b].insts.push(inst(Opcode::MovRd, vec![vreg(v2)], vec![imm(2)]));
    f.blocks[b].insts.push(inst(Opcode::MovRd, vec![vreg(v3)], vec![vreg(v1)]));
    f.blocks[b]
        .insts
        .push(inst(Opcode::Add, vec![vreg(v3)], vec![vreg(v3), vreg(v2)]));
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![]));

    allocate(&mut f);
    assigned_regs(&f);

    // v1 and v2 are simultaneously live, so their colors differ.
    let first = match &f.blocks[0].insts[2].outputs[0] {
        MachineOperand::Hreg { reg, .. } => *reg,
        other => panic!("unexpected operand {:?}", other),
    };
    let second = match &f.blocks[0].insts[3].outputs[0] {
        MachineOperand::Hreg { reg, .. } => *reg,
        other => panic!("unexpected operand {:?}", other),
    };
    assert_ne!(first, second);
    assert_eq!(f.stack_slots, 0);
}

#[test]
fn precolored_registers_keep_their_assignment() {
    let (mut f, b) = function_with_prologue();
    let vrax = f.create_precolored(HwReg::Rax, ValueType::U64);

    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(vrax)], vec![imm(7)]));
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![vreg(vrax)]));

    allocate(&mut f);

    let ret = f.blocks[0].insts.last().unwrap();
    assert_eq!(
        ret.inputs[0],
        MachineOperand::Hreg {
            reg: HwReg::Rax,
            ty: ValueType::U64,
        }
    );
}

#[test]
fn more_live_values_than_colors_forces_a_spill() {
    let (mut f, b) = function_with_prologue();

    let count = 20;
    let regs: Vec<VregId> = (0..count).map(|_| f.create_vreg(ValueType::U64)).collect();

    // Define everything, then consume everything: all twenty are live
    // at once against fourteen colors.
    for (i, &r) in regs.iter().enumerate() {
        f.blocks[b]
            .insts
            .push(inst(Opcode::MovRd, vec![vreg(r)], vec![imm(i as i64)]));
    }
    let acc = f.create_vreg(ValueType::U64);
    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(acc)], vec![vreg(regs[0])]));
    for &r in &regs[1..] {
        f.blocks[b]
            .insts
            .push(inst(Opcode::Add, vec![vreg(acc)], vec![vreg(acc), vreg(r)]));
    }
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![]));

    allocate(&mut f);
    assigned_regs(&f);

    assert!(f.stack_slots > 0, "twenty live values cannot be colored");

    // The frame adjustment sits right after the prologue, 16-byte
    // aligned.
    let sub = &f.blocks[0].insts[2];
    assert_eq!(sub.opcode, Opcode::Sub);
    let bytes = sub.inputs[1].imm_value().unwrap();
    assert!(bytes >= 8 * f.stack_slots as i64);
    assert_eq!(bytes % 16, 0);
}

#[test]
fn values_live_across_a_call_avoid_caller_save_registers() {
    let (mut f, b) = function_with_prologue();
    let v = f.create_vreg(ValueType::U64);
    let vrax = f.create_precolored(HwReg::Rax, ValueType::U64);

    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(v)], vec![imm(7)]));
    f.blocks[b].insts.push(inst(
        Opcode::Call,
        vec![vreg(vrax)],
        vec![MachineOperand::Address {
            name: "helper".to_string(),
            ty: ValueType::CodeAddress,
            clinkage: false,
        }],
    ));
    let out = f.create_vreg(ValueType::U64);
    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(out)], vec![vreg(v)]));
    f.blocks[b]
        .insts
        .push(inst(Opcode::Add, vec![vreg(out)], vec![vreg(out), vreg(vrax)]));
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![vreg(out)]));

    allocate(&mut f);
    assigned_regs(&f);

    // v lives across the call, so it cannot sit in a caller-save
    // register (or it spilled, which also preserves it).
    let first_mov = &f.blocks[0].insts[2];
    if first_mov.opcode == Opcode::MovRd {
        if let MachineOperand::Hreg { reg, .. } = &first_mov.outputs[0] {
            assert!(
                !RegSet::caller_save().has(*reg),
                "{} is clobbered by the call",
                reg
            );
        }
    }
}

#[test]
fn redundant_moves_are_deleted_after_assignment() {
    let mut f = MachineFunction::new("test");
    let b = f.create_block(0).index();

    let rax64 = MachineOperand::Hreg {
        reg: HwReg::Rax,
        ty: ValueType::U64,
    };
    let rax8 = MachineOperand::Hreg {
        reg: HwReg::Rax,
        ty: ValueType::U8,
    };
    let rcx64 = MachineOperand::Hreg {
        reg: HwReg::Rcx,
        ty: ValueType::U64,
    };

    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![rax64.clone()], vec![rax64.clone()]));
    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![rax64.clone()], vec![rcx64.clone()]));
    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![rax8.clone()], vec![rax64.clone()]));
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![]));

    eliminate_redundant_moves(&mut f);

    let opcodes: Vec<Opcode> = f.blocks[0].insts.iter().map(|i| i.opcode).collect();
    // Same register at the same width goes; different register or
    // different width stays.
    assert_eq!(opcodes, vec![Opcode::MovRd, Opcode::MovRd, Opcode::Ret]);
    assert_eq!(f.blocks[0].insts[0].inputs[0], rcx64);
}

#[test]
fn coalescing_removes_a_register_to_register_move() {
    let (mut f, b) = function_with_prologue();
    let v1 = f.create_vreg(ValueType::U64);
    let v2 = f.create_vreg(ValueType::U64);

    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(v1)], vec![imm(5)]));
    // v1 dies here; the move is coalescible.
    f.blocks[b]
        .insts
        .push(inst(Opcode::MovRd, vec![vreg(v2)], vec![vreg(v1)]));
    f.blocks[b]
        .insts
        .push(inst(Opcode::Add, vec![vreg(v2)], vec![vreg(v2), imm(1)]));
    f.blocks[b].insts.push(inst(Opcode::Ret, vec![], vec![]));

    allocate(&mut f);
    assigned_regs(&f);

    let moves = f.blocks[0]
        .insts
        .iter()
        .filter(|i| {
            i.opcode == Opcode::MovRd
                && i.inputs[0].is_register()
                && i.outputs[0].is_register()
        })
        .count();
    // Only the prologue frame move survives.
    assert_eq!(moves, 1);
}
