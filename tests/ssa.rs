//! SSA formation and destruction over hand-built and lowered IR.

use ember_codegen::ir::ssa::{dominance_frontiers, find_dominators, immediate_dominators};
use ember_codegen::ir::{from_ssa, validate, InstKind, IrContext, ValueId, ValueType};
use ember_codegen::prelude::*;

/// entry → header; header → body | exit; body → header.
fn loop_cfg(ctx: &mut IrContext) -> (ValueId, Vec<ValueId>) {
    let f = ctx.create_function("test");
    let entry = ctx.create_block(f);
    let header = ctx.create_block(f);
    let body = ctx.create_block(f);
    let exit = ctx.create_block(f);

    let one = ctx.const_int(ValueType::I64, 1);
    ctx.append_inst(entry, InstKind::Jump { target: header });
    ctx.append_inst(
        header,
        InstKind::JumpIf {
            cond: one,
            if_true: body,
            if_false: exit,
        },
    );
    ctx.append_inst(body, InstKind::Jump { target: header });
    ctx.append_inst(exit, InstKind::Return { value: None });

    (f, vec![entry, header, body, exit])
}

#[test]
fn dominators_of_a_reducible_loop() {
    let mut ctx = IrContext::new();
    let (f, blocks) = loop_cfg(&mut ctx);
    let (entry, header, body, exit) = (blocks[0], blocks[1], blocks[2], blocks[3]);

    let dom = find_dominators(&ctx, f);
    assert_eq!(dom[&entry].iter().copied().collect::<Vec<_>>(), vec![entry]);
    assert!(dom[&header].contains(&entry) && dom[&header].contains(&header));
    assert_eq!(dom[&header].len(), 2);
    assert!(dom[&body].contains(&header) && dom[&body].len() == 3);
    assert!(dom[&exit].contains(&header) && !dom[&exit].contains(&body));

    let idom = immediate_dominators(&dom);
    assert_eq!(idom[&entry], None);
    assert_eq!(idom[&header], Some(entry));
    assert_eq!(idom[&body], Some(header));
    assert_eq!(idom[&exit], Some(header));
}

#[test]
fn dominance_frontier_matches_its_definition() {
    let mut ctx = IrContext::new();
    let (f, blocks) = loop_cfg(&mut ctx);

    let dom = find_dominators(&ctx, f);
    let idom = immediate_dominators(&dom);
    let df = dominance_frontiers(&ctx, &idom);

    let (header, body) = (blocks[1], blocks[2]);
    assert_eq!(df.get(&body), Some(&vec![header]));
    assert_eq!(df.get(&header), Some(&vec![header]));

    // j ∈ DF(b) iff some predecessor of j is dominated by b while b
    // does not strictly dominate j.
    for &b in &blocks {
        for &j in &blocks {
            let in_frontier = df.get(&b).map_or(false, |set| set.contains(&j));
            let has_dominated_pred = ctx
                .value(j)
                .block()
                .preds
                .iter()
                .any(|p| dom[p].contains(&b));
            let strictly_dominates = b != j && dom[&j].contains(&b);
            assert_eq!(
                in_frontier,
                has_dominated_pred && !strictly_dominates,
                "frontier mismatch for ({:?}, {:?})",
                b,
                j
            );
        }
    }
}

fn int(n: i64) -> Expr {
    Expr::Int(n)
}

fn var(name: &str, ty: Type) -> Expr {
    Expr::Var(name.to_string(), ty)
}

/// `let y = 0; if c { y = 1 } else { y = 2 }; return y`
fn merge_program() -> Program {
    Program {
        functions: vec![
            FunctionDef {
                name: "f".to_string(),
                type_params: vec![],
                params: vec![Param {
                    name: "c".to_string(),
                    ty: Type::Bool,
                }],
                ret: Type::Int,
                body: vec![
                    Stmt::Let {
                        name: "y".to_string(),
                        ty: Type::Int,
                        init: int(0),
                    },
                    Stmt::If {
                        cond: var("c", Type::Bool),
                        then_body: vec![Stmt::Assign {
                            target: LValue::Var("y".to_string(), Type::Int),
                            value: int(1),
                        }],
                        else_body: vec![Stmt::Assign {
                            target: LValue::Var("y".to_string(), Type::Int),
                            value: int(2),
                        }],
                    },
                    Stmt::Return(Some(var("y", Type::Int))),
                ],
            },
            FunctionDef {
                name: "main".to_string(),
                type_params: vec![],
                params: vec![],
                ret: Type::Unit,
                body: vec![Stmt::Expr(Expr::Call {
                    callee: "f".to_string(),
                    type_args: TypeAssignment::new(),
                    args: vec![Expr::Bool(true)],
                    ty: Type::Int,
                    span: Span::default(),
                })],
            },
        ],
        ..Program::default()
    }
}

fn find_function(ctx: &IrContext, name: &str) -> ValueId {
    ctx.functions
        .iter()
        .copied()
        .find(|&f| ctx.value(f).name.as_deref() == Some(name))
        .unwrap()
}

#[test]
fn merged_assignments_become_a_phi() {
    let options = CompileOptions {
        optimize: false,
        validate: true,
    };
    let ctx = ember_codegen::pipeline::build_ssa(&merge_program(), &options).unwrap();
    let f = find_function(&ctx, "f");

    let mut phis = 0;
    for &block in &ctx.value(f).function().blocks {
        let preds = ctx.value(block).block().preds.len();
        for &inst in &ctx.value(block).block().insts {
            if let InstKind::Phi { sources, .. } = &ctx.inst(inst).kind {
                phis += 1;
                assert_eq!(sources.len(), preds);
                assert!(sources.iter().all(|(_, v)| v.is_some()));
            }
            // No load or store of the eliminated local remains.
            match &ctx.inst(inst).kind {
                InstKind::Load { src, .. } => assert!(!ctx.value(*src).is_local()),
                InstKind::Store { dest, .. } => assert!(!ctx.value(*dest).is_local()),
                _ => {}
            }
        }
    }
    assert_eq!(phis, 1);
    assert!(ctx.value(f).function().locals.is_empty());
}

#[test]
fn destruction_replaces_phis_with_predecessor_copies() {
    let options = CompileOptions {
        optimize: false,
        validate: true,
    };
    let mut ctx = ember_codegen::pipeline::build_ssa(&merge_program(), &options).unwrap();
    let f = find_function(&ctx, "f");

    let phi_dest = ctx
        .value(f)
        .function()
        .blocks
        .iter()
        .flat_map(|&b| ctx.value(b).block().insts.clone())
        .find_map(|i| match &ctx.inst(i).kind {
            InstKind::Phi { dest, .. } => Some(*dest),
            _ => None,
        })
        .expect("phi before destruction");

    from_ssa::from_ssa(&mut ctx, f);

    let mut copies = 0;
    for &block in &ctx.value(f).function().blocks {
        for &inst in &ctx.value(block).block().insts {
            assert!(!matches!(ctx.inst(inst).kind, InstKind::Phi { .. }));
            if let InstKind::Copy { dest, .. } = ctx.inst(inst).kind {
                if dest == phi_dest {
                    copies += 1;
                }
            }
        }
    }
    assert_eq!(copies, 2);
}

#[test]
fn destruction_splits_critical_edges() {
    let mut ctx = IrContext::new();
    let f = ctx.create_function("test");
    let b0 = ctx.create_block(f);
    let b1 = ctx.create_block(f);
    let b2 = ctx.create_block(f);

    let one = ctx.const_int(ValueType::I64, 1);
    let zero = ctx.const_int(ValueType::I64, 0);

    // b0 → {b1, b2}; b1 → b2. The b0 → b2 edge is critical.
    let x0 = ctx.create_temp(f, ValueType::I64);
    ctx.append_inst(b0, InstKind::Copy { dest: x0, src: one });
    ctx.append_inst(
        b0,
        InstKind::ConditionalJump {
            op: ember_codegen::ir::CmpOp::Eq,
            lhs: one,
            rhs: zero,
            if_true: b2,
            if_false: b1,
        },
    );
    let x1 = ctx.create_temp(f, ValueType::I64);
    ctx.append_inst(b1, InstKind::Copy { dest: x1, src: zero });
    ctx.append_inst(b1, InstKind::Jump { target: b2 });

    let merged = ctx.create_temp(f, ValueType::I64);
    ctx.append_inst(
        b2,
        InstKind::Phi {
            dest: merged,
            sources: vec![(b0, Some(x0)), (b1, Some(x1))],
        },
    );
    ctx.append_inst(b2, InstKind::Return { value: Some(merged) });

    validate::validate(&ctx).unwrap();
    from_ssa::from_ssa(&mut ctx, f);

    // A fresh block now sits on the b0 → b2 edge.
    let blocks = ctx.value(f).function().blocks.clone();
    assert_eq!(blocks.len(), 4);
    let split = blocks[3];
    assert!(ctx.successors(b0).contains(&split));
    assert!(!ctx.successors(b0).contains(&b2));
    assert_eq!(ctx.successors(split), vec![b2]);

    // The copy for the b0 path landed in the split block.
    let split_insts = ctx.value(split).block().insts.clone();
    assert!(matches!(
        ctx.inst(split_insts[0]).kind,
        InstKind::Copy { src, .. } if src == x0
    ));
}

#[test]
fn validator_rejects_an_unterminated_block() {
    let mut ctx = IrContext::new();
    let f = ctx.create_function("broken");
    let b0 = ctx.create_block(f);
    let one = ctx.const_int(ValueType::I64, 1);
    let t = ctx.create_temp(f, ValueType::I64);
    ctx.append_inst(b0, InstKind::Copy { dest: t, src: one });

    assert!(validate::validate(&ctx).is_err());
}

#[test]
fn validator_rejects_a_non_slot_use_of_a_local() {
    let mut ctx = IrContext::new();
    let f = ctx.create_function("broken");
    let b0 = ctx.create_block(f);
    let local = ctx.create_local(f, ValueType::I64, "x");
    let one = ctx.const_int(ValueType::I64, 1);

    let t = ctx.create_temp(f, ValueType::I64);
    ctx.append_inst(
        b0,
        InstKind::BinaryOp {
            dest: t,
            op: ember_codegen::ir::BinOp::Add,
            lhs: local,
            rhs: one,
        },
    );
    ctx.append_inst(b0, InstKind::Return { value: Some(t) });

    assert!(validate::validate(&ctx).is_err());
}
