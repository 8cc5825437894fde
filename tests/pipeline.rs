//! End-to-end scenarios over the full pipeline.

use ember_codegen::ir::{InstKind, IrContext, ValueId};
use ember_codegen::prelude::*;

fn int(n: i64) -> Expr {
    Expr::Int(n)
}

fn var(name: &str, ty: Type) -> Expr {
    Expr::Var(name.to_string(), ty)
}

fn call(callee: &str, args: Vec<Expr>, ty: Type) -> Expr {
    Expr::Call {
        callee: callee.to_string(),
        type_args: TypeAssignment::new(),
        args,
        ty,
        span: Span::default(),
    }
}

fn param(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
    }
}

fn fun(name: &str, params: Vec<Param>, ret: Type, body: Vec<Stmt>) -> FunctionDef {
    FunctionDef {
        name: name.to_string(),
        type_params: Vec::new(),
        params,
        ret,
        body,
    }
}

fn program(functions: Vec<FunctionDef>) -> Program {
    Program {
        functions,
        ..Program::default()
    }
}

fn find_function(ctx: &IrContext, name: &str) -> ValueId {
    ctx.functions
        .iter()
        .copied()
        .find(|&f| ctx.value(f).name.as_deref() == Some(name))
        .unwrap_or_else(|| panic!("no function named {}", name))
}

fn function_insts(ctx: &IrContext, func: ValueId) -> Vec<InstKind> {
    let mut out = Vec::new();
    for &block in &ctx.value(func).function().blocks {
        for &inst in &ctx.value(block).block().insts {
            out.push(ctx.inst(inst).kind.clone());
        }
    }
    out
}

fn extern_named(ctx: &IrContext, name: &str) -> ValueId {
    ctx.externs
        .iter()
        .copied()
        .find(|&e| ctx.value(e).name.as_deref() == Some(name))
        .expect("runtime extern missing")
}

#[test]
fn identity_function_collapses_to_one_block() {
    let p = program(vec![
        fun(
            "id",
            vec![param("x", Type::Int)],
            Type::Int,
            vec![Stmt::Return(Some(var("x", Type::Int)))],
        ),
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![call("id", vec![int(42)], Type::Int)],
                Type::Unit,
            ))],
        ),
    ]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let id = find_function(&ctx, "id");
    assert_eq!(ctx.value(id).function().blocks.len(), 1);
    let insts = function_insts(&ctx, id);
    assert!(insts.iter().all(|k| !matches!(k, InstKind::Phi { .. })));
    assert!(insts
        .iter()
        .any(|k| matches!(k, InstKind::Return { value: Some(_) })));
}

#[test]
fn identity_argument_and_return_share_a_register() {
    let p = program(vec![
        fun(
            "id",
            vec![param("x", Type::Int)],
            Type::Int,
            vec![Stmt::Return(Some(var("x", Type::Int)))],
        ),
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![call("id", vec![int(42)], Type::Int)],
                Type::Unit,
            ))],
        ),
    ]);

    let module = compile(&p).unwrap();
    let id = module
        .functions
        .iter()
        .find(|f| f.name == "id")
        .expect("id was compiled");

    let mut loaded = None;
    let mut returned = None;
    for block in &id.blocks {
        for inst in &block.insts {
            if inst.opcode == Opcode::MovRm {
                if let Some(MachineOperand::Hreg { reg, .. }) = inst.outputs.first() {
                    loaded = Some(*reg);
                }
            }
            if inst.opcode == Opcode::Ret {
                if let Some(MachineOperand::Hreg { reg, .. }) = inst.inputs.first() {
                    returned = Some(*reg);
                }
            }
        }
    }
    assert_eq!(loaded.expect("argument load"), returned.expect("return register"));
}

#[test]
fn factorial_recursion_is_a_single_self_call_and_never_spills() {
    let p = program(vec![
        fun(
            "fact",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![Stmt::If {
                cond: Expr::Compare {
                    op: CmpOp::Eq,
                    lhs: Box::new(var("n", Type::Int)),
                    rhs: Box::new(int(0)),
                },
                then_body: vec![Stmt::Return(Some(int(1)))],
                else_body: vec![Stmt::Return(Some(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(var("n", Type::Int)),
                    rhs: Box::new(call(
                        "fact",
                        vec![Expr::Binary {
                            op: BinOp::Sub,
                            lhs: Box::new(var("n", Type::Int)),
                            rhs: Box::new(int(1)),
                            ty: Type::Int,
                        }],
                        Type::Int,
                    )),
                    ty: Type::Int,
                }))],
            }],
        ),
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![call("fact", vec![int(5)], Type::Int)],
                Type::Unit,
            ))],
        ),
    ]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let fact = find_function(&ctx, "fact");
    let self_calls = function_insts(&ctx, fact)
        .iter()
        .filter(|k| matches!(k, InstKind::Call { target, .. } if *target == fact))
        .count();
    assert_eq!(self_calls, 1);

    let module = compile(&p).unwrap();
    let fact = module.functions.iter().find(|f| f.name == "fact").unwrap();
    assert_eq!(fact.stack_slots, 0);
}

fn maybe_program(arms: Vec<MatchArm>) -> Program {
    let maybe = DataDef {
        name: "Maybe".to_string(),
        type_params: Vec::new(),
        constructors: vec![
            ConstructorDef {
                name: "Nothing".to_string(),
                fields: Vec::new(),
            },
            ConstructorDef {
                name: "Just".to_string(),
                fields: vec![Type::Int],
            },
        ],
    };
    let maybe_ty = Type::Adt("Maybe".to_string(), Vec::new());

    Program {
        functions: vec![fun(
            "main",
            vec![],
            Type::Unit,
            vec![
                Stmt::Let {
                    name: "m".to_string(),
                    ty: maybe_ty.clone(),
                    init: Expr::Construct {
                        ctor: "Just".to_string(),
                        type_args: TypeAssignment::new(),
                        args: vec![int(7)],
                        ty: maybe_ty.clone(),
                    },
                },
                Stmt::Match {
                    scrutinee: var("m", maybe_ty),
                    arms,
                },
            ],
        )],
        datatypes: vec![maybe],
        ..Program::default()
    }
}

#[test]
fn match_on_maybe_emits_one_dispatch_and_one_payload_load() {
    let p = maybe_program(vec![
        MatchArm {
            ctor: "Just".to_string(),
            binders: vec!["x".to_string()],
            body: vec![Stmt::Expr(call(
                "print",
                vec![var("x", Type::Int)],
                Type::Unit,
            ))],
        },
        MatchArm {
            ctor: "Nothing".to_string(),
            binders: vec![],
            body: vec![],
        },
    ]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let main = find_function(&ctx, "encmain");
    let insts = function_insts(&ctx, main);

    let dispatches = insts
        .iter()
        .filter(|k| matches!(k, InstKind::BinaryOp { op: ember_codegen::ir::BinOp::And, .. }))
        .count();
    let loads = insts
        .iter()
        .filter(|k| matches!(k, InstKind::IndexedLoad { .. }))
        .count();
    assert_eq!(dispatches, 1);
    // One header load plus one payload load.
    assert_eq!(loads, 2);

    let die = extern_named(&ctx, "die");
    assert!(!insts
        .iter()
        .any(|k| matches!(k, InstKind::Call { target, .. } if *target == die)));
}

#[test]
fn incomplete_match_panics_at_fall_through() {
    let p = maybe_program(vec![MatchArm {
        ctor: "Just".to_string(),
        binders: vec!["x".to_string()],
        body: vec![Stmt::Expr(call(
            "print",
            vec![var("x", Type::Int)],
            Type::Unit,
        ))],
    }]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let main = find_function(&ctx, "encmain");
    let die = extern_named(&ctx, "die");
    assert!(function_insts(&ctx, main)
        .iter()
        .any(|k| matches!(k, InstKind::Call { target, .. } if *target == die)));
}

#[test]
fn closure_with_two_captures_allocates_three_words() {
    let fn_ty = Type::Func(vec![Type::Int], Box::new(Type::Int));
    let p = program(vec![fun(
        "main",
        vec![],
        Type::Unit,
        vec![
            Stmt::Let {
                name: "a".to_string(),
                ty: Type::Int,
                init: int(1),
            },
            Stmt::Let {
                name: "b".to_string(),
                ty: Type::Int,
                init: int(2),
            },
            Stmt::Let {
                name: "f".to_string(),
                ty: fn_ty.clone(),
                init: Expr::Lambda {
                    params: vec![param("x", Type::Int)],
                    captures: vec![
                        ("a".to_string(), Type::Int),
                        ("b".to_string(), Type::Int),
                    ],
                    body: Box::new(Expr::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(var("x", Type::Int)),
                        rhs: Box::new(var("a", Type::Int)),
                        ty: Type::Int,
                    }),
                    ty: fn_ty.clone(),
                },
            },
            Stmt::Expr(call(
                "print",
                vec![Expr::CallIndirect {
                    closure: Box::new(var("f", fn_ty)),
                    args: vec![int(3)],
                    ty: Type::Int,
                }],
                Type::Unit,
            )),
        ],
    )]);

    let options = CompileOptions {
        optimize: false,
        validate: true,
    };
    let ctx = ember_codegen::pipeline::build_ssa(&p, &options).unwrap();
    let main = find_function(&ctx, "encmain");
    let insts = function_insts(&ctx, main);

    // The closure block is a code pointer plus two captured words.
    let gc = extern_named(&ctx, "gcAllocate");
    let sizes: Vec<i64> = insts
        .iter()
        .filter_map(|k| match k {
            InstKind::Call { target, args, .. } if *target == gc => {
                ctx.value(args[0]).as_const_int()
            }
            _ => None,
        })
        .collect();
    assert!(sizes.contains(&24), "closure allocation sizes: {:?}", sizes);

    // Invocation loads the code word and passes the closure last.
    let code_loads = insts
        .iter()
        .filter_map(|k| match k {
            InstKind::IndexedLoad { dest, offset, .. }
                if ctx.value(*offset).as_const_int() == Some(0) =>
            {
                Some(*dest)
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    let indirect = insts.iter().find_map(|k| match k {
        InstKind::Call { target, args, .. } if code_loads.contains(target) => Some(args.clone()),
        _ => None,
    });
    let args = indirect.expect("closure invocation");
    assert_eq!(args.len(), 2);

    // The lambda body was lifted to its own function.
    assert!(ctx
        .functions
        .iter()
        .any(|&f| ctx.value(f).name.as_deref() == Some("lambda$0")));
}

#[test]
fn global_read_only_in_main_is_demoted() {
    let p = Program {
        functions: vec![fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![var("g", Type::Int)],
                Type::Unit,
            ))],
        )],
        globals: vec![GlobalDef {
            name: "g".to_string(),
            ty: Type::Int,
            init: int(10),
        }],
        ..Program::default()
    };

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    assert!(ctx.globals.is_empty());

    let module = compile(&p).unwrap();
    assert!(module.globals.is_empty());
}

#[test]
fn global_shared_across_functions_survives() {
    let p = Program {
        functions: vec![
            fun(
                "reader",
                vec![],
                Type::Int,
                vec![Stmt::Return(Some(var("g", Type::Int)))],
            ),
            fun(
                "main",
                vec![],
                Type::Unit,
                vec![Stmt::Expr(call(
                    "print",
                    vec![call("reader", vec![], Type::Int)],
                    Type::Unit,
                ))],
            ),
        ],
        globals: vec![GlobalDef {
            name: "g".to_string(),
            ty: Type::Int,
            init: int(10),
        }],
        ..Program::default()
    };

    let module = compile(&p).unwrap();
    assert_eq!(module.globals, vec!["_Z1g".to_string()]);
}

#[test]
fn constant_operands_fold_to_a_single_operation() {
    let p = program(vec![
        fun(
            "f",
            vec![param("a", Type::Int)],
            Type::Int,
            vec![Stmt::Return(Some(Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(var("a", Type::Int)),
                rhs: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(int(2)),
                    rhs: Box::new(int(3)),
                    ty: Type::Int,
                }),
                ty: Type::Int,
            }))],
        ),
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![call("f", vec![int(1)], Type::Int)],
                Type::Unit,
            ))],
        ),
    ]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let f = find_function(&ctx, "f");
    let insts = function_insts(&ctx, f);

    let binops: Vec<_> = insts
        .iter()
        .filter_map(|k| match k {
            InstKind::BinaryOp { op, lhs, rhs, .. } => Some((*op, *lhs, *rhs)),
            _ => None,
        })
        .collect();
    assert_eq!(binops.len(), 1);
    let (op, _, rhs) = binops[0];
    assert_eq!(op, ember_codegen::ir::BinOp::Add);
    // 2 * 3, folded through the boxing algebra to a raw constant.
    assert_eq!(ctx.value(rhs).as_const_int(), Some(6));
}

#[test]
fn unresolved_generic_call_is_a_monomorphization_error() {
    let p = program(vec![
        FunctionDef {
            name: "poly".to_string(),
            type_params: vec![0],
            params: vec![param("x", Type::Var(0))],
            ret: Type::Var(0),
            body: vec![Stmt::Return(Some(var("x", Type::Var(0))))],
        },
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call("poly", vec![int(1)], Type::Int))],
        ),
    ]);

    let err = compile(&p).unwrap_err();
    assert!(err.is_monomorphization());
}

#[test]
fn generic_function_instantiates_once_per_assignment() {
    let mut int_args = TypeAssignment::new();
    int_args.insert(0, Type::Int);

    let p = program(vec![
        FunctionDef {
            name: "same".to_string(),
            type_params: vec![0],
            params: vec![param("x", Type::Var(0))],
            ret: Type::Var(0),
            body: vec![Stmt::Return(Some(var("x", Type::Var(0))))],
        },
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![
                Stmt::Expr(Expr::Call {
                    callee: "same".to_string(),
                    type_args: int_args.clone(),
                    args: vec![int(1)],
                    ty: Type::Int,
                    span: Span::default(),
                }),
                Stmt::Expr(Expr::Call {
                    callee: "same".to_string(),
                    type_args: int_args,
                    args: vec![int(2)],
                    ty: Type::Int,
                    span: Span::default(),
                }),
            ],
        ),
    ]);

    let ctx = ember_codegen::pipeline::build_ssa(&p, &CompileOptions::default()).unwrap();
    let instances = ctx
        .functions
        .iter()
        .filter(|&&f| {
            ctx.value(f)
                .name
                .as_deref()
                .map_or(false, |n| n.starts_with("same$"))
        })
        .count();
    assert_eq!(instances, 1);
}

#[test]
fn compile_time_division_by_zero_is_rejected() {
    let p = program(vec![fun(
        "main",
        vec![],
        Type::Unit,
        vec![Stmt::Expr(call(
            "print",
            vec![Expr::Binary {
                op: BinOp::Div,
                lhs: Box::new(int(1)),
                rhs: Box::new(int(0)),
                ty: Type::Int,
            }],
            Type::Unit,
        ))],
    )]);

    let err = compile(&p).unwrap_err();
    assert!(matches!(err, CompileError::Codegen(_)));
}

#[test]
fn allocated_output_has_no_virtual_registers() {
    let p = program(vec![
        fun(
            "fact",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![Stmt::If {
                cond: Expr::Compare {
                    op: CmpOp::Eq,
                    lhs: Box::new(var("n", Type::Int)),
                    rhs: Box::new(int(0)),
                },
                then_body: vec![Stmt::Return(Some(int(1)))],
                else_body: vec![Stmt::Return(Some(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(var("n", Type::Int)),
                    rhs: Box::new(call(
                        "fact",
                        vec![Expr::Binary {
                            op: BinOp::Sub,
                            lhs: Box::new(var("n", Type::Int)),
                            rhs: Box::new(int(1)),
                            ty: Type::Int,
                        }],
                        Type::Int,
                    )),
                    ty: Type::Int,
                }))],
            }],
        ),
        fun(
            "main",
            vec![],
            Type::Unit,
            vec![Stmt::Expr(call(
                "print",
                vec![call("fact", vec![int(5)], Type::Int)],
                Type::Unit,
            ))],
        ),
    ]);

    let module = compile(&p).unwrap();
    for f in &module.functions {
        for block in &f.blocks {
            for inst in &block.insts {
                for operand in inst.outputs.iter().chain(&inst.inputs) {
                    assert!(
                        !matches!(operand, MachineOperand::Vreg(_)),
                        "virtual register survived allocation in {}: {}",
                        f.name,
                        inst
                    );
                }
            }
        }
    }
}
