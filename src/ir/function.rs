//! Function and block mutation
//!
//! All instruction insertion and removal goes through these helpers so
//! that use-sets, definitions, and predecessor lists stay consistent.

use crate::ir::context::IrContext;
use crate::ir::inst::{Inst, InstId, InstKind};
use crate::ir::value::ValueId;

use std::collections::BTreeSet;

impl IrContext {
    /// Append an instruction to `block`, registering uses, the
    /// definition, and predecessor links of branch targets.
    pub fn append_inst(&mut self, block: ValueId, kind: InstKind) -> InstId {
        let at = self.value(block).block().insts.len();
        self.insert_inst(block, at, kind)
    }

    /// Insert an instruction at `index` within `block`.
    pub fn insert_inst(&mut self, block: ValueId, index: usize, kind: InstKind) -> InstId {
        let id = self.alloc_inst(Inst {
            parent: block,
            kind,
            dead: false,
        });
        self.value_mut(block).block_mut().insts.insert(index, id);
        self.register(id);
        id
    }

    /// Insert an instruction just before the terminator of `block`, or
    /// at the end if the block is not yet terminated.
    pub fn insert_before_terminator(&mut self, block: ValueId, kind: InstKind) -> InstId {
        let insts = &self.value(block).block().insts;
        let at = match insts.last() {
            Some(&last) if self.inst(last).kind.is_terminator() => insts.len() - 1,
            _ => insts.len(),
        };
        self.insert_inst(block, at, kind)
    }

    /// Unlink an instruction from its block and mark it dead.
    pub fn remove_inst(&mut self, id: InstId) {
        self.unregister(id);
        let parent = self.inst(id).parent;
        let block = self.value_mut(parent).block_mut();
        block.insts.retain(|&i| i != id);
        self.inst_mut(id).dead = true;
    }

    fn register(&mut self, id: InstId) {
        let kind = self.inst(id).kind.clone();
        let parent = self.inst(id).parent;

        for used in kind.uses() {
            self.value_mut(used).uses.insert(id);
        }
        // After SSA destruction a temp may be written by one copy per
        // predecessor; the first definition wins for bookkeeping.
        if let Some(dest) = kind.dest() {
            let value = self.value_mut(dest);
            if value.def.is_none() {
                value.def = Some(id);
            }
        }
        for target in kind.targets() {
            let preds = &mut self.value_mut(target).block_mut().preds;
            if !preds.contains(&parent) {
                preds.push(parent);
            }
        }
    }

    fn unregister(&mut self, id: InstId) {
        let kind = self.inst(id).kind.clone();
        let parent = self.inst(id).parent;

        for used in kind.uses() {
            self.value_mut(used).uses.remove(&id);
        }
        if let Some(dest) = kind.dest() {
            self.value_mut(dest).def = None;
        }
        for target in kind.targets() {
            let preds = &mut self.value_mut(target).block_mut().preds;
            if let Some(pos) = preds.iter().position(|&p| p == parent) {
                preds.remove(pos);
            }
        }
    }

    /// The terminator of `block`, if its last instruction is one.
    pub fn terminator(&self, block: ValueId) -> Option<InstId> {
        let last = *self.value(block).block().insts.last()?;
        self.inst(last).kind.is_terminator().then_some(last)
    }

    /// Successor blocks, derived from the terminator.
    pub fn successors(&self, block: ValueId) -> Vec<ValueId> {
        let Some(term) = self.terminator(block) else {
            return Vec::new();
        };
        let mut succs = Vec::new();
        for target in self.inst(term).kind.targets() {
            if !succs.contains(&target) {
                succs.push(target);
            }
        }
        succs
    }

    /// Redirect the `old → new` edge out of `block`'s terminator,
    /// keeping predecessor lists consistent.
    pub fn retarget(&mut self, block: ValueId, old: ValueId, new: ValueId) {
        let term = self.terminator(block).expect("retarget of unterminated block");
        self.unregister(term);
        self.inst_mut(term).kind.replace(old, new);
        self.register(term);
    }

    /// Rewrite every reference to `from` into `to`, walking a snapshot
    /// of the use-set. `from` must not be a block; edges are rewired
    /// with [`IrContext::retarget`] instead.
    pub fn replace_references(&mut self, from: ValueId, to: ValueId) {
        debug_assert!(!self.value(from).is_block());

        let uses: Vec<InstId> = self.value(from).uses.iter().copied().collect();
        for id in uses {
            self.value_mut(from).uses.remove(&id);
            self.inst_mut(id).kind.replace(from, to);
            self.value_mut(to).uses.insert(id);
        }

        debug_assert!(self.value(from).uses.is_empty());
        debug_assert!(self.value(from).def.is_none());
        self.kill_temp(from);
    }

    /// Drop a dead temporary from its owner's temp list.
    pub fn kill_temp(&mut self, value: ValueId) {
        if !self.value(value).is_temp() {
            return;
        }
        let Some(owner) = self.value(value).owner else {
            return;
        };
        self.value_mut(owner)
            .function_mut()
            .temps
            .retain(|&t| t != value);
    }

    /// Register `arg` as the next parameter of `func`.
    pub fn add_param(&mut self, func: ValueId, arg: ValueId) {
        self.value_mut(arg).owner = Some(func);
        self.value_mut(func).function_mut().params.push(arg);
    }

    /// Delete blocks unreachable from the entry. Run at the end of TAC
    /// construction, before any block can own a phi.
    pub fn prune_unreachable_blocks(&mut self, func: ValueId) {
        let blocks = self.value(func).function().blocks.clone();
        let Some(&entry) = blocks.first() else {
            return;
        };

        let mut reached = BTreeSet::new();
        let mut worklist = vec![entry];
        while let Some(block) = worklist.pop() {
            if !reached.insert(block) {
                continue;
            }
            worklist.extend(self.successors(block));
        }

        for &block in &blocks {
            if reached.contains(&block) {
                continue;
            }
            let insts = self.value(block).block().insts.clone();
            for inst in insts {
                let dest = self.inst(inst).kind.dest();
                self.remove_inst(inst);
                // Anything defined here was only usable here.
                if let Some(dest) = dest {
                    self.kill_temp(dest);
                }
            }
        }
        self.value_mut(func)
            .function_mut()
            .blocks
            .retain(|b| reached.contains(b));
    }
}
