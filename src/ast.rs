//! Typed AST input to the code generator
//!
//! The semantic phase (external to this crate) produces this tree.
//! Every expression carries a resolved [`Type`], call sites carry a
//! [`TypeAssignment`] for the callee's type variables, and member
//! accesses carry an already-resolved field index. The code generator
//! neither performs nor re-verifies type inference.

use std::collections::BTreeMap;
use std::fmt;

/// A type variable introduced by a generic function or datatype.
pub type TypeVar = u32;

/// Substitution of type variables to concrete types, attached to every
/// generic call site. Ordered so that monomorphization cache keys are
/// deterministic.
pub type TypeAssignment = BTreeMap<TypeVar, Type>;

/// Source location of a call site, carried for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub const fn new(line: u32, col: u32) -> Self {
        Span { line, col }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Width and signedness of a sized integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntType {
    pub bits: u8,
    pub signed: bool,
}

impl IntType {
    pub const I8: Self = IntType { bits: 8, signed: true };
    pub const U8: Self = IntType { bits: 8, signed: false };
    pub const I16: Self = IntType { bits: 16, signed: true };
    pub const U16: Self = IntType { bits: 16, signed: false };
    pub const I32: Self = IntType { bits: 32, signed: true };
    pub const U32: Self = IntType { bits: 32, signed: false };
    pub const I64: Self = IntType { bits: 64, signed: true };
    pub const U64: Self = IntType { bits: 64, signed: false };
}

/// A resolved source-language type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Type {
    Unit,
    Bool,
    /// The default integer: 63 bits, boxed by tagging.
    Int,
    /// A raw fixed-width integer.
    Sized(IntType),
    Str,
    Array(Box<Type>),
    List(Box<Type>),
    /// A closure type: parameters and return.
    Func(Vec<Type>, Box<Type>),
    /// An algebraic datatype applied to type arguments.
    Adt(String, Vec<Type>),
    /// A nominal record applied to type arguments.
    Record(String, Vec<Type>),
    Var(TypeVar),
}

impl Type {
    /// Substitute type variables according to `subst`. Variables
    /// without an entry are left in place.
    pub fn apply(&self, subst: &TypeAssignment) -> Type {
        match self {
            Type::Var(v) => subst.get(v).cloned().unwrap_or(Type::Var(*v)),
            Type::Array(t) => Type::Array(Box::new(t.apply(subst))),
            Type::List(t) => Type::List(Box::new(t.apply(subst))),
            Type::Func(params, ret) => Type::Func(
                params.iter().map(|t| t.apply(subst)).collect(),
                Box::new(ret.apply(subst)),
            ),
            Type::Adt(name, args) => {
                Type::Adt(name.clone(), args.iter().map(|t| t.apply(subst)).collect())
            }
            Type::Record(name, args) => {
                Type::Record(name.clone(), args.iter().map(|t| t.apply(subst)).collect())
            }
            other => other.clone(),
        }
    }

    /// Collect the type variables still free in this type.
    pub fn free_vars(&self, out: &mut Vec<TypeVar>) {
        match self {
            Type::Var(v) => {
                if !out.contains(v) {
                    out.push(*v);
                }
            }
            Type::Array(t) | Type::List(t) => t.free_vars(out),
            Type::Func(params, ret) => {
                for p in params {
                    p.free_vars(out);
                }
                ret.free_vars(out);
            }
            Type::Adt(_, args) | Type::Record(_, args) => {
                for a in args {
                    a.free_vars(out);
                }
            }
            _ => {}
        }
    }

    /// Whether the type contains no free type variables.
    pub fn is_concrete(&self) -> bool {
        let mut vars = Vec::new();
        self.free_vars(&mut vars);
        vars.is_empty()
    }

    /// Whether values of this type are heap references the collector
    /// must trace. Tagged integers are self-describing and raw
    /// integers are never traced, so neither counts.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Type::Str | Type::Array(_) | Type::List(_) | Type::Func(..) | Type::Adt(..) | Type::Record(..)
        )
    }
}

/// Arithmetic and bitwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Shl,
    Shr,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Short-circuit logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A typed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Unit,
    Int(i64),
    SizedInt(i64, IntType),
    Bool(bool),
    Str(String),
    /// The empty list, carrying its element type.
    Nil(Type),
    /// A variable reference: local, argument, or global.
    Var(String, Type),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        ty: Type,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        to: Type,
    },
    /// A direct call to a named function or builtin.
    Call {
        callee: String,
        type_args: TypeAssignment,
        args: Vec<Expr>,
        ty: Type,
        span: Span,
    },
    /// Invocation of a closure value.
    CallIndirect {
        closure: Box<Expr>,
        args: Vec<Expr>,
        ty: Type,
    },
    /// A trait method call on a receiver.
    MethodCall {
        trait_name: String,
        method: String,
        recv: Box<Expr>,
        args: Vec<Expr>,
        ty: Type,
        span: Span,
    },
    /// Application of a datatype constructor or record literal.
    Construct {
        ctor: String,
        type_args: TypeAssignment,
        args: Vec<Expr>,
        ty: Type,
    },
    /// Field access with a resolved index.
    Member {
        obj: Box<Expr>,
        index: usize,
        ty: Type,
    },
    /// Array subscript.
    Index {
        array: Box<Expr>,
        index: Box<Expr>,
        ty: Type,
    },
    /// An anonymous function with its resolved capture list.
    Lambda {
        params: Vec<Param>,
        captures: Vec<(String, Type)>,
        body: Box<Expr>,
        ty: Type,
    },
}

impl Expr {
    /// The resolved type of this expression.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Unit => Type::Unit,
            Expr::Int(_) => Type::Int,
            Expr::SizedInt(_, it) => Type::Sized(*it),
            Expr::Bool(_) => Type::Bool,
            Expr::Str(_) => Type::Str,
            Expr::Nil(elem) => Type::List(Box::new(elem.clone())),
            Expr::Var(_, ty) => ty.clone(),
            Expr::Binary { ty, .. } => ty.clone(),
            Expr::Compare { .. } | Expr::Logical { .. } | Expr::Not(_) => Type::Bool,
            Expr::Neg(e) => e.ty(),
            Expr::Cast { to, .. } => to.clone(),
            Expr::Call { ty, .. } => ty.clone(),
            Expr::CallIndirect { ty, .. } => ty.clone(),
            Expr::MethodCall { ty, .. } => ty.clone(),
            Expr::Construct { ty, .. } => ty.clone(),
            Expr::Member { ty, .. } => ty.clone(),
            Expr::Index { ty, .. } => ty.clone(),
            Expr::Lambda { ty, .. } => ty.clone(),
        }
    }
}

/// Assignment targets.
#[derive(Debug, Clone)]
pub enum LValue {
    Var(String, Type),
    Member { obj: Expr, index: usize, ty: Type },
    Index { array: Expr, index: Expr, ty: Type },
}

/// A typed statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: String,
        ty: Type,
        init: Expr,
    },
    Assign {
        target: LValue,
        value: Expr,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Forever {
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Match {
        scrutinee: Expr,
        arms: Vec<MatchArm>,
    },
    Assert {
        cond: Expr,
    },
}

/// One arm of a match statement: a constructor pattern with binders.
#[derive(Debug, Clone)]
pub struct MatchArm {
    pub ctor: String,
    pub binders: Vec<String>,
    pub body: Vec<Stmt>,
}

/// A formal parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// A (possibly generic) function definition.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub type_params: Vec<TypeVar>,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Vec<Stmt>,
}

/// A module-scope variable. Its initializer runs at the top of
/// `encmain`.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    pub ty: Type,
    pub init: Expr,
}

/// An algebraic datatype definition.
#[derive(Debug, Clone)]
pub struct DataDef {
    pub name: String,
    pub type_params: Vec<TypeVar>,
    pub constructors: Vec<ConstructorDef>,
}

/// One constructor of a datatype.
#[derive(Debug, Clone)]
pub struct ConstructorDef {
    pub name: String,
    pub fields: Vec<Type>,
}

/// A nominal record definition. Lowered like a single-constructor
/// datatype with discriminant zero.
#[derive(Debug, Clone)]
pub struct RecordDef {
    pub name: String,
    pub type_params: Vec<TypeVar>,
    pub fields: Vec<Param>,
}

/// A foreign function with C linkage.
#[derive(Debug, Clone)]
pub struct ExternDef {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

/// A trait implementation for a concrete target type.
#[derive(Debug, Clone)]
pub struct ImplDef {
    pub trait_name: String,
    pub target: Type,
    pub methods: Vec<FunctionDef>,
}

/// A complete type-checked program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<FunctionDef>,
    pub globals: Vec<GlobalDef>,
    pub datatypes: Vec<DataDef>,
    pub records: Vec<RecordDef>,
    pub externs: Vec<ExternDef>,
    pub impls: Vec<ImplDef>,
}

impl Program {
    /// Look up a top-level function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a foreign function by name.
    pub fn extern_fn(&self, name: &str) -> Option<&ExternDef> {
        self.externs.iter().find(|e| e.name == name)
    }

    /// Resolve a constructor name to its datatype, discriminant, and
    /// definition.
    pub fn constructor(&self, name: &str) -> Option<(&DataDef, usize, &ConstructorDef)> {
        for data in &self.datatypes {
            for (i, ctor) in data.constructors.iter().enumerate() {
                if ctor.name == name {
                    return Some((data, i, ctor));
                }
            }
        }
        None
    }

    /// Look up a record definition by name.
    pub fn record(&self, name: &str) -> Option<&RecordDef> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Resolve a trait method against a concrete receiver type. Type
    /// arguments on the receiver are matched on the head constructor.
    pub fn resolve_method(&self, trait_name: &str, recv: &Type, method: &str) -> Option<&FunctionDef> {
        let imp = self.impls.iter().find(|i| {
            if i.trait_name != trait_name {
                return false;
            }
            match (&i.target, recv) {
                (Type::Adt(a, _), Type::Adt(b, _)) => a == b,
                (Type::Record(a, _), Type::Record(b, _)) => a == b,
                (a, b) => a == b,
            }
        })?;
        imp.methods.iter().find(|m| m.name == method)
    }
}
