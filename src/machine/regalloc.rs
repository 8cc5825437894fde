//! Graph-coloring register allocation
//!
//! Chaitin-Briggs over 14 colors (`rsp` and `rbp` are reserved).
//! Precolored virtual registers participate fully in the interference
//! graph but are never simplified or spilled. After every spill round
//! the whole analysis re-runs. All iteration is over ordered maps so
//! the assignment is deterministic.

use crate::consts::{AVAILABLE_COLORS, WORD_SIZE};
use crate::ir::value::ValueType;
use crate::machine::inst::{
    HwReg, MachineFunction, MachineInst, MachineOperand, Opcode, RegSet, VregId,
};

use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

type Graph = BTreeMap<VregId, BTreeSet<VregId>>;
type Coloring = BTreeMap<VregId, usize>;

/// Assign every virtual register of `f` a hardware register or a
/// stack slot.
pub fn allocate(f: &mut MachineFunction) {
    spill_around_calls(f);

    loop {
        let live = Liveness::compute(f);
        let mut graph = build_interference(f, &live);

        if coalesce_moves(f, &mut graph) {
            // Live ranges changed shape; start over.
            continue;
        }

        let (coloring, spilled) = color_graph(f, &graph);
        if spilled.is_empty() {
            assign_registers(f, &coloring);
            insert_frame_adjustment(f);
            return;
        }

        for vreg in spilled {
            rewrite_spill(f, vreg);
        }
    }
}

/// A node for every allocatable register operand. Registers pinned to
/// `rsp`/`rbp` stay out of the graph; they own no color.
fn node(f: &MachineFunction, operand: &MachineOperand) -> Option<VregId> {
    let id = operand.vreg()?;
    match f.precolor(id) {
        Some(HwReg::Rsp) | Some(HwReg::Rbp) => None,
        _ => Some(id),
    }
}

fn inst_uses(f: &MachineFunction, inst: &MachineInst) -> Vec<VregId> {
    inst.inputs.iter().filter_map(|o| node(f, o)).collect()
}

fn inst_defs(f: &MachineFunction, inst: &MachineInst) -> Vec<VregId> {
    inst.outputs.iter().filter_map(|o| node(f, o)).collect()
}

/// Append implicit definitions of every caller-save register to each
/// call, so values live across it interfere and move to callee-save
/// registers or spill.
fn spill_around_calls(f: &mut MachineFunction) {
    for block in 0..f.blocks.len() {
        for index in 0..f.blocks[block].insts.len() {
            if f.blocks[block].insts[index].opcode != Opcode::Call {
                continue;
            }

            let mut present = RegSet::empty();
            for operand in &f.blocks[block].insts[index].outputs {
                if let Some(id) = operand.vreg() {
                    if let Some(reg) = f.precolor(id) {
                        present |= RegSet::of(reg);
                    }
                }
            }

            for reg in HwReg::CALLER_SAVE {
                if present.has(reg) {
                    continue;
                }
                let clobber = f.create_precolored(reg, ValueType::U64);
                f.blocks[block].insts[index]
                    .outputs
                    .push(MachineOperand::Vreg(clobber));
            }
        }
    }
}

struct Liveness {
    /// Registers live on entry to each block.
    live_in: Vec<BTreeSet<VregId>>,
    successors: Vec<Vec<usize>>,
}

impl Liveness {
    /// Standard backward data flow to a fixpoint:
    /// `LIVE_IN(b) = USE(b) ∪ (LIVE_OUT(b) − DEF(b))`.
    fn compute(f: &MachineFunction) -> Liveness {
        let block_count = f.blocks.len();

        let mut uses: Vec<BTreeSet<VregId>> = vec![BTreeSet::new(); block_count];
        let mut defs: Vec<BTreeSet<VregId>> = vec![BTreeSet::new(); block_count];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); block_count];

        for (b, block) in f.blocks.iter().enumerate() {
            for inst in &block.insts {
                for used in inst_uses(f, inst) {
                    if !defs[b].contains(&used) {
                        uses[b].insert(used);
                    }
                }
                for defined in inst_defs(f, inst) {
                    defs[b].insert(defined);
                }
                for operand in &inst.inputs {
                    if let MachineOperand::Label(target) = operand {
                        if !successors[b].contains(&target.index()) {
                            successors[b].push(target.index());
                        }
                    }
                }
            }
        }

        let mut live_in: Vec<BTreeSet<VregId>> = vec![BTreeSet::new(); block_count];
        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..block_count).rev() {
                let mut live_out = BTreeSet::new();
                for &s in &successors[b] {
                    live_out.extend(live_in[s].iter().copied());
                }
                let mut new_in = uses[b].clone();
                for reg in live_out {
                    if !defs[b].contains(&reg) {
                        new_in.insert(reg);
                    }
                }
                if new_in != live_in[b] {
                    live_in[b] = new_in;
                    changed = true;
                }
            }
        }

        Liveness {
            live_in,
            successors,
        }
    }

    fn live_out(&self, block: usize) -> BTreeSet<VregId> {
        let mut out = BTreeSet::new();
        for &s in &self.successors[block] {
            out.extend(self.live_in[s].iter().copied());
        }
        out
    }
}

/// Walk each block backwards from `LIVE_OUT`; definitions interfere
/// with everything live across them, and simultaneous definitions
/// interfere with each other.
fn build_interference(f: &MachineFunction, liveness: &Liveness) -> Graph {
    let mut graph = Graph::new();

    fn touch(graph: &mut Graph, id: VregId) {
        graph.entry(id).or_default();
    }
    fn edge(graph: &mut Graph, a: VregId, b: VregId) {
        if a != b {
            graph.entry(a).or_default().insert(b);
            graph.entry(b).or_default().insert(a);
        }
    }

    for (b, block) in f.blocks.iter().enumerate() {
        let mut live = liveness.live_out(b);

        for inst in block.insts.iter().rev() {
            let defs = inst_defs(f, inst);
            let uses = inst_uses(f, inst);

            for &id in defs.iter().chain(&uses) {
                touch(&mut graph, id);
            }

            for &d in &defs {
                for &l in &live {
                    edge(&mut graph, d, l);
                }
            }
            for (&d1, &d2) in defs.iter().tuple_combinations() {
                edge(&mut graph, d1, d2);
            }

            for d in defs {
                live.remove(&d);
            }
            live.extend(uses);
        }
    }

    graph
}

/// Briggs-conservative coalescing: merge the two sides of a move when
/// they do not interfere and the combined node keeps fewer than
/// [`AVAILABLE_COLORS`] high-degree neighbors. Returns whether any
/// move was removed.
fn coalesce_moves(f: &mut MachineFunction, graph: &mut Graph) -> bool {
    let mut changed = false;

    for block in 0..f.blocks.len() {
        let mut index = 0;
        while index < f.blocks[block].insts.len() {
            let inst = &f.blocks[block].insts[index];
            let candidate = if inst.opcode == Opcode::MovRd
                && inst.outputs.len() == 1
                && inst.inputs.len() == 1
            {
                match (node(f, &inst.outputs[0]), node(f, &inst.inputs[0])) {
                    (Some(dst), Some(src)) if dst != src => Some((dst, src)),
                    _ => None,
                }
            } else {
                None
            };

            let Some((dst, src)) = candidate else {
                index += 1;
                continue;
            };

            let same_width = f.vreg_type(dst).bits() == f.vreg_type(src).bits();
            let interferes = graph
                .get(&dst)
                .map_or(false, |neighbors| neighbors.contains(&src));
            let both_precolored = f.precolor(dst).is_some() && f.precolor(src).is_some();

            if !same_width || interferes || both_precolored {
                index += 1;
                continue;
            }

            // Briggs criterion on the merged node.
            let empty = BTreeSet::new();
            let combined: BTreeSet<VregId> = graph
                .get(&dst)
                .unwrap_or(&empty)
                .union(graph.get(&src).unwrap_or(&empty))
                .copied()
                .filter(|&n| n != dst && n != src)
                .collect();
            let high_degree = combined
                .iter()
                .filter(|n| graph.get(n).map_or(0, |s| s.len()) >= AVAILABLE_COLORS)
                .count();
            if high_degree >= AVAILABLE_COLORS {
                index += 1;
                continue;
            }

            // Merging into a precolored node must not make it adjacent
            // to another node pinned to the same register.
            let pinned = f.precolor(dst).or_else(|| f.precolor(src));
            if let Some(reg) = pinned {
                if combined.iter().any(|&n| f.precolor(n) == Some(reg)) {
                    index += 1;
                    continue;
                }
            }

            // Keep the precolored side, if either is.
            let (keep, gone) = if f.precolor(src).is_some() {
                (src, dst)
            } else {
                (dst, src)
            };

            merge_nodes(graph, keep, gone);
            rewrite_vreg(f, gone, keep);
            f.blocks[block].insts.remove(index);
            debug!(%keep, %gone, "coalesced move");
            changed = true;
        }
    }

    changed
}

fn merge_nodes(graph: &mut Graph, keep: VregId, gone: VregId) {
    let neighbors = graph.remove(&gone).unwrap_or_default();
    for n in neighbors {
        if let Some(set) = graph.get_mut(&n) {
            set.remove(&gone);
            if n != keep {
                set.insert(keep);
                graph.entry(keep).or_default().insert(n);
            }
        }
    }
}

fn rewrite_vreg(f: &mut MachineFunction, from: VregId, to: VregId) {
    for block in &mut f.blocks {
        for inst in &mut block.insts {
            for operand in inst.outputs.iter_mut().chain(inst.inputs.iter_mut()) {
                if operand.vreg() == Some(from) {
                    *operand = MachineOperand::Vreg(to);
                }
            }
        }
    }
}

/// How often a register appears, for the spill tie-break.
fn use_counts(f: &MachineFunction) -> BTreeMap<VregId, usize> {
    let mut counts = BTreeMap::new();
    for block in &f.blocks {
        for inst in &block.insts {
            for operand in inst.outputs.iter().chain(&inst.inputs) {
                if let Some(id) = operand.vreg() {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
        }
    }
    counts
}

/// Kempe simplification with Chaitin spill selection: push low-degree
/// nodes, mark the worst high-degree node for spilling when stuck,
/// then pop and pick the lowest free color.
fn color_graph(f: &MachineFunction, graph: &Graph) -> (Coloring, Vec<VregId>) {
    let counts = use_counts(f);
    let mut working = graph.clone();
    let mut stack: Vec<VregId> = Vec::new();
    let mut spilled: Vec<VregId> = Vec::new();

    let remove = |working: &mut Graph, id: VregId| {
        let neighbors = working.remove(&id).unwrap_or_default();
        for n in neighbors {
            if let Some(set) = working.get_mut(&n) {
                set.remove(&id);
            }
        }
    };

    loop {
        let simplifiable = working
            .iter()
            .find(|(id, neighbors)| {
                f.precolor(**id).is_none() && neighbors.len() < AVAILABLE_COLORS
            })
            .map(|(&id, _)| id);
        if let Some(id) = simplifiable {
            remove(&mut working, id);
            stack.push(id);
            continue;
        }

        // Only high-degree uncolored nodes remain: pick a spill
        // candidate by highest degree, breaking ties on fewest uses.
        let candidate = working
            .iter()
            .filter(|(id, _)| f.precolor(**id).is_none())
            .max_by_key(|(id, neighbors)| {
                (
                    neighbors.len(),
                    std::cmp::Reverse(counts.get(id).copied().unwrap_or(0)),
                )
            })
            .map(|(&id, _)| id);
        match candidate {
            Some(id) => {
                remove(&mut working, id);
                spilled.push(id);
            }
            None => break,
        }
    }

    // Precolored registers own their colors from the start.
    let mut coloring = Coloring::new();
    for &id in graph.keys() {
        if let Some(reg) = f.precolor(id) {
            coloring.insert(id, reg.color().expect("reserved register in graph"));
        }
    }

    for &id in stack.iter().rev() {
        let mut taken = RegSet::empty();
        for neighbor in &graph[&id] {
            if let Some(&color) = coloring.get(neighbor) {
                taken |= RegSet::of(HwReg::ALLOCATION_ORDER[color]);
            }
        }
        let free = (0..AVAILABLE_COLORS)
            .find(|&c| !taken.has(HwReg::ALLOCATION_ORDER[c]));
        match free {
            Some(color) => {
                coloring.insert(id, color);
            }
            // An optimistic node that found no color spills after all.
            None => spilled.push(id),
        }
    }

    (coloring, spilled)
}

/// Give `vreg` a stack slot: each definition stores to it, each use
/// reloads through a fresh register.
fn rewrite_spill(f: &mut MachineFunction, vreg: VregId) {
    let slot = f.stack_slots;
    f.stack_slots += 1;
    let ty = f.vreg_type(vreg);
    let offset = -(WORD_SIZE as i32) * (slot as i32 + 1);
    let stack = MachineOperand::Stack { offset, ty };

    debug!(%vreg, slot, "spilling");

    for block in 0..f.blocks.len() {
        let old = std::mem::take(&mut f.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());

        for mut inst in old {
            let used = inst.inputs.iter().any(|o| o.vreg() == Some(vreg));
            let defined = inst.outputs.iter().any(|o| o.vreg() == Some(vreg));
            if !used && !defined {
                new.push(inst);
                continue;
            }

            // A single replacement keeps two-address forms intact.
            let fresh = f.create_vreg(ty);
            for operand in inst.outputs.iter_mut().chain(inst.inputs.iter_mut()) {
                if operand.vreg() == Some(vreg) {
                    *operand = MachineOperand::Vreg(fresh);
                }
            }

            if used {
                new.push(MachineInst {
                    opcode: Opcode::MovRm,
                    outputs: vec![MachineOperand::Vreg(fresh)],
                    inputs: vec![stack.clone()],
                });
            }
            new.push(inst);
            if defined {
                new.push(MachineInst {
                    opcode: Opcode::MovMd,
                    outputs: vec![],
                    inputs: vec![stack.clone(), MachineOperand::Vreg(fresh)],
                });
            }
        }

        f.blocks[block].insts = new;
    }
}

/// Rewrite every virtual register operand with its hardware register.
fn assign_registers(f: &mut MachineFunction, coloring: &Coloring) {
    for block in 0..f.blocks.len() {
        for index in 0..f.blocks[block].insts.len() {
            let inst = &mut f.blocks[block].insts[index];
            for operand in inst.outputs.iter_mut().chain(inst.inputs.iter_mut()) {
                let Some(id) = operand.vreg() else {
                    continue;
                };
                let ty = f.vregs[id.index()].ty;
                let reg = match f.vregs[id.index()].precolor {
                    Some(reg @ (HwReg::Rsp | HwReg::Rbp)) => reg,
                    _ => {
                        let color = coloring[&id];
                        HwReg::ALLOCATION_ORDER[color]
                    }
                };
                *operand = MachineOperand::Hreg { reg, ty };
            }
        }
    }
}

/// Reserve the spill area below the saved frame pointer, keeping the
/// stack 16-byte aligned.
fn insert_frame_adjustment(f: &mut MachineFunction) {
    if f.stack_slots == 0 {
        return;
    }
    let bytes = (WORD_SIZE * f.stack_slots as i64 + 15) & !15;
    let rsp = MachineOperand::Hreg {
        reg: HwReg::Rsp,
        ty: ValueType::U64,
    };
    let amount = MachineOperand::Imm {
        value: bytes,
        ty: ValueType::U64,
    };
    // Entry starts with PUSHQ rbp; MOV rbp, rsp.
    f.blocks[0].insts.insert(
        2,
        MachineInst {
            opcode: Opcode::Sub,
            outputs: vec![rsp.clone()],
            inputs: vec![rsp, amount],
        },
    );
}
