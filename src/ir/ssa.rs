//! SSA formation
//!
//! Four phases per function: dominators, immediate dominators,
//! dominance frontiers, then phi placement and renaming. Loads and
//! stores of locals and arguments disappear; globals keep theirs.

use crate::ir::context::IrContext;
use crate::ir::inst::InstKind;
use crate::ir::value::ValueId;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

pub type Dominators = BTreeMap<ValueId, BTreeSet<ValueId>>;
pub type ImmDominators = BTreeMap<ValueId, Option<ValueId>>;
pub type DomFrontier = BTreeMap<ValueId, Vec<ValueId>>;

/// A phi node planned for a block, before materialization.
struct PhiDescription {
    original: ValueId,
    dest: Option<ValueId>,
    sources: Vec<(ValueId, Option<ValueId>)>,
}

type PhiList = BTreeMap<ValueId, Vec<PhiDescription>>;

/// Convert `func` to SSA form.
pub fn to_ssa(ctx: &mut IrContext, func: ValueId) {
    SsaTransform {
        ctx,
        func,
        stacks: BTreeMap::new(),
        counters: BTreeMap::new(),
        visited: BTreeSet::new(),
    }
    .run()
}

/// Compute the dominator sets of every block of `func`.
///
/// Simple quadratic fixpoint over the recursive definition:
/// `DOM(b) = {b} ∪ ⋂ DOM(p)` over predecessors `p`.
pub fn find_dominators(ctx: &IrContext, func: ValueId) -> Dominators {
    let blocks = ctx.value(func).function().blocks.clone();
    let mut dom = Dominators::new();

    // The only dominator of the entry block is itself.
    let entry = blocks[0];
    dom.insert(entry, BTreeSet::from([entry]));

    let all: BTreeSet<ValueId> = blocks.iter().copied().collect();
    for &block in &blocks[1..] {
        dom.insert(block, all.clone());
    }

    let mut changed = true;
    while changed {
        changed = false;

        for &block in &blocks[1..] {
            let preds = ctx.value(block).block().preds.clone();

            let mut new_dom: BTreeSet<ValueId> = match preds.first() {
                Some(&first) => {
                    let mut set = dom[&first].clone();
                    for &p in &preds[1..] {
                        set = set.intersection(&dom[&p]).copied().collect();
                    }
                    set
                }
                None => BTreeSet::new(),
            };
            new_dom.insert(block);

            if new_dom != dom[&block] {
                dom.insert(block, new_dom);
                changed = true;
            }
        }
    }

    dom
}

/// Strip each block's dominator set down to its unique immediate
/// dominator. The entry block has none.
pub fn immediate_dominators(dom: &Dominators) -> ImmDominators {
    let mut idom = ImmDominators::new();

    for (&block, dominators) in dom {
        let mut working = dominators.clone();
        // The immediate dominator is a strict dominator.
        working.remove(&block);

        // Remove every element strictly dominated by another element.
        for &d1 in dominators {
            if d1 == block {
                continue;
            }
            for &d2 in dominators {
                if d1 != d2 && d2 != block && dom[&d1].contains(&d2) {
                    working.remove(&d2);
                }
            }
        }

        match working.len() {
            1 => {
                idom.insert(block, working.iter().next().copied());
            }
            0 => {
                idom.insert(block, None);
            }
            _ => unreachable!("multiple immediate dominator candidates"),
        }
    }

    idom
}

/// Walk from each predecessor of every join block up the idom tree,
/// collecting the frontier.
pub fn dominance_frontiers(ctx: &IrContext, idom: &ImmDominators) -> DomFrontier {
    let mut df = DomFrontier::new();

    for (&block, &dominator) in idom {
        let preds = ctx.value(block).block().preds.clone();
        if preds.len() < 2 {
            continue;
        }

        for pred in preds {
            let mut runner = Some(pred);
            while runner != dominator {
                let r = runner.expect("idom walk escaped the entry block");
                df.entry(r).or_default().push(block);
                runner = idom[&r];
            }
        }
    }

    df
}

struct SsaTransform<'a> {
    ctx: &'a mut IrContext,
    func: ValueId,
    /// Current SSA name per original variable.
    stacks: BTreeMap<ValueId, Vec<ValueId>>,
    counters: BTreeMap<ValueId, usize>,
    visited: BTreeSet<ValueId>,
}

impl<'a> SsaTransform<'a> {
    fn run(mut self) {
        let dom = find_dominators(self.ctx, self.func);
        let idom = immediate_dominators(&dom);
        let df = dominance_frontiers(self.ctx, &idom);
        let mut phis = self.calculate_phi_nodes(&df);

        let entry = self.ctx.value(self.func).function().blocks[0];
        self.rename(entry, &mut phis);
        self.insert_phis(phis);
        self.kill_dead_phis();

        // Every surviving load or store of a local has been rewritten.
        let func = self.func;
        let dead: Vec<ValueId> = self
            .ctx
            .value(func)
            .function()
            .locals
            .iter()
            .copied()
            .filter(|&l| self.ctx.value(l).uses.is_empty())
            .collect();
        self.ctx
            .value_mut(func)
            .function_mut()
            .locals
            .retain(|l| !dead.contains(l));
    }

    /// Seed a worklist with every block storing the variable; insert
    /// phis across dominance frontiers until the worklist drains.
    fn place_for_variable(
        &self,
        variable: ValueId,
        implicit_entry_store: bool,
        df: &DomFrontier,
        result: &mut PhiList,
    ) {
        let mut worklist = VecDeque::new();
        let mut ever_on_worklist = BTreeSet::new();
        let mut already_inserted = BTreeSet::new();

        for &inst in &self.ctx.value(variable).uses {
            if matches!(self.ctx.inst(inst).kind, InstKind::Store { dest, .. } if dest == variable)
            {
                let block = self.ctx.inst(inst).parent;
                if ever_on_worklist.insert(block) {
                    worklist.push_back(block);
                }
            }
        }

        // Arguments carry an assumed store in the entry block.
        if implicit_entry_store {
            let entry = self.ctx.value(self.func).function().blocks[0];
            if ever_on_worklist.insert(entry) {
                worklist.push_back(entry);
            }
        }

        while let Some(next) = worklist.pop_front() {
            let Some(frontier) = df.get(&next) else {
                continue;
            };
            for &join in frontier {
                if !already_inserted.insert(join) {
                    continue;
                }
                result.entry(join).or_default().push(PhiDescription {
                    original: variable,
                    dest: None,
                    sources: Vec::new(),
                });
                if ever_on_worklist.insert(join) {
                    worklist.push_back(join);
                }
            }
        }
    }

    fn calculate_phi_nodes(&self, df: &DomFrontier) -> PhiList {
        let mut result = PhiList::new();
        let data = self.ctx.value(self.func).function();
        let locals = data.locals.clone();
        let params = data.params.clone();

        for local in locals {
            self.place_for_variable(local, false, df, &mut result);
        }
        for param in params {
            self.place_for_variable(param, true, df, &mut result);
        }

        result
    }

    /// A fresh SSA name for `variable`, pushed as its current name.
    fn generate_name(&mut self, variable: ValueId) -> ValueId {
        let counter = self.counters.entry(variable).or_insert(0);
        let index = *counter;
        *counter += 1;

        let base = self
            .ctx
            .value(variable)
            .name
            .clone()
            .unwrap_or_else(|| "v".to_string());
        let ty = self.ctx.value(variable).ty;
        let name = format!("{}.{}", base, index);
        let fresh = self.ctx.create_named_temp(self.func, ty, &name);
        self.stacks.entry(variable).or_default().push(fresh);
        fresh
    }

    fn top(&self, variable: ValueId) -> Option<ValueId> {
        self.stacks.get(&variable).and_then(|s| s.last().copied())
    }

    fn rename(&mut self, block: ValueId, phis: &mut PhiList) {
        if !self.visited.insert(block) {
            return;
        }

        // Names created here, so they can be undone on the way out.
        let mut to_pop: Vec<ValueId> = Vec::new();

        if let Some(descs) = phis.get_mut(&block) {
            for desc in descs.iter_mut() {
                let fresh = self.generate_name(desc.original);
                desc.dest = Some(fresh);
                to_pop.push(desc.original);
            }
        }

        // Rewrite loads and stores with current names.
        let insts = self.ctx.value(block).block().insts.clone();
        for inst in insts {
            if self.ctx.inst(inst).dead {
                continue;
            }
            match self.ctx.inst(inst).kind.clone() {
                InstKind::Load { dest, src } => {
                    if self.top(src).is_none() {
                        // Loads from globals stay as they are.
                        if self.ctx.value(src).is_global() {
                            continue;
                        }

                        // A load with no prior store is only possible
                        // for a function parameter.
                        debug_assert!(self.ctx.value(src).is_argument());

                        // Anything dominated by this block reuses the
                        // loaded value instead of re-loading.
                        self.stacks.entry(src).or_default().push(dest);
                        to_pop.push(src);
                    } else {
                        let new_name = self.top(src).unwrap();
                        self.ctx.remove_inst(inst);
                        self.ctx.replace_references(dest, new_name);
                    }
                }
                InstKind::Store { dest, src } => {
                    // Stores to globals stay as they are.
                    if self.ctx.value(dest).is_global() {
                        continue;
                    }

                    self.stacks.entry(dest).or_default().push(src);
                    to_pop.push(dest);
                    self.ctx.remove_inst(inst);
                }
                _ => {}
            }
        }

        // Fix up phi operands of successors before recursing.
        for succ in self.ctx.successors(block) {
            if let Some(descs) = phis.get_mut(&succ) {
                for desc in descs.iter_mut() {
                    let current = self
                        .stacks
                        .get(&desc.original)
                        .and_then(|s| s.last().copied());
                    // A predecessor with no definition contributes a
                    // placeholder, resolved after the walk.
                    desc.sources.push((block, current));
                }
            }
        }

        for succ in self.ctx.successors(block) {
            self.rename(succ, phis);
        }

        for variable in to_pop {
            let stack = self.stacks.get_mut(&variable).expect("unbalanced name stack");
            stack.pop();
        }
    }

    fn insert_phis(&mut self, phis: PhiList) {
        for (block, descs) in phis {
            for desc in descs {
                let dest = desc.dest.expect("phi never renamed");

                let mut sources = Vec::with_capacity(desc.sources.len());
                let mut dropped = false;
                for (pred, value) in desc.sources {
                    let value = match value {
                        Some(v) => Some(v),
                        None if self.ctx.value(desc.original).is_argument() => {
                            // Arguments have an implicit entry store:
                            // materialize the missing load in the
                            // predecessor.
                            let fresh = self.generate_name(desc.original);
                            self.stacks.get_mut(&desc.original).unwrap().pop();
                            self.ctx.insert_before_terminator(
                                pred,
                                InstKind::Load {
                                    dest: fresh,
                                    src: desc.original,
                                },
                            );
                            Some(fresh)
                        }
                        None => {
                            // A local undefined along this path: the
                            // phi result had better be dead.
                            dropped = true;
                            break;
                        }
                    };
                    sources.push((pred, value));
                }

                if dropped {
                    if self.ctx.value(dest).uses.is_empty() {
                        self.ctx.kill_temp(dest);
                    }
                    continue;
                }

                self.ctx.insert_inst(block, 0, InstKind::Phi { dest, sources });
            }
        }
    }

    /// Prune phis whose results have no uses.
    fn kill_dead_phis(&mut self) {
        let blocks = self.ctx.value(self.func).function().blocks.clone();
        let mut killed = 0usize;
        for block in blocks {
            let insts = self.ctx.value(block).block().insts.clone();
            for inst in insts {
                let dest = match &self.ctx.inst(inst).kind {
                    InstKind::Phi { dest, .. } => *dest,
                    _ => break,
                };
                if self.ctx.value(dest).uses.is_empty() {
                    self.ctx.remove_inst(inst);
                    self.ctx.kill_temp(dest);
                    killed += 1;
                }
            }
        }
        if killed > 0 {
            debug!(killed, "pruned dead phis");
        }
    }
}
