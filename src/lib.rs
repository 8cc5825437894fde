//! Ember compiler middle and back end
//!
//! Turns a type-checked AST into allocated x86-64 machine IR: TAC
//! construction with monomorphization, SSA formation and optimization,
//! machine lowering, and graph-coloring register allocation. Lexing,
//! parsing, type checking, the runtime, and assembly emission live
//! elsewhere.

pub mod ast;
pub mod consts;
pub mod error;
pub mod ir;
pub mod machine;
pub mod mangle;
pub mod pipeline;

pub mod prelude {
    pub use crate::ast::{
        BinOp, CmpOp, ConstructorDef, DataDef, Expr, ExternDef, FunctionDef, GlobalDef, ImplDef,
        IntType, LValue, LogicalOp, MatchArm, Param, Program, RecordDef, Span, Stmt, Type,
        TypeAssignment,
    };
    pub use crate::error::{CodegenError, CompileError, MonomorphizationError};
    pub use crate::ir::{IrContext, ValueId, ValueType};
    pub use crate::machine::{
        HwReg, MachineFunction, MachineModule, MachineOperand, Opcode, RegSet,
    };
    pub use crate::pipeline::{compile, compile_with, CompileOptions};
}
