//! IR values: temporaries, locals, arguments, constants, globals,
//! blocks, and functions

use crate::ast::IntType;
use crate::ir::inst::InstId;

use std::collections::BTreeSet;
use std::fmt;

/// Handle to a [`Value`] in the context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Representation tag of an IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    /// A word that is either a heap reference or a tagged 63-bit
    /// integer; the low bit distinguishes the two.
    BoxOrInt,
    /// A raw machine integer of the given width and signedness.
    Integer(IntType),
    /// The address of a function.
    CodeAddress,
}

impl ValueType {
    pub const I8: Self = ValueType::Integer(IntType::I8);
    pub const U8: Self = ValueType::Integer(IntType::U8);
    pub const I16: Self = ValueType::Integer(IntType::I16);
    pub const U16: Self = ValueType::Integer(IntType::U16);
    pub const I32: Self = ValueType::Integer(IntType::I32);
    pub const U32: Self = ValueType::Integer(IntType::U32);
    pub const I64: Self = ValueType::Integer(IntType::I64);
    pub const U64: Self = ValueType::Integer(IntType::U64);

    /// Bit width of values of this type.
    pub const fn bits(self) -> u8 {
        match self {
            ValueType::Integer(it) => it.bits,
            ValueType::BoxOrInt | ValueType::CodeAddress => 64,
        }
    }

    pub const fn is_signed(self) -> bool {
        match self {
            ValueType::Integer(it) => it.signed,
            _ => false,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, ValueType::Integer(_))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::BoxOrInt => write!(f, "box"),
            ValueType::Integer(it) => {
                write!(f, "{}{}", if it.signed { 'i' } else { 'u' }, it.bits)
            }
            ValueType::CodeAddress => write!(f, "code"),
        }
    }
}

/// Linkage class of a module-scope name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalTag {
    Variable,
    Function,
    Static,
}

/// Per-block payload: the owning function, the ordered instruction
/// list, and the explicit predecessor list. Successors are always
/// derived from the terminator.
#[derive(Debug)]
pub struct BlockData {
    pub parent: ValueId,
    pub insts: Vec<InstId>,
    pub preds: Vec<ValueId>,
}

/// Per-function payload. Block 0 is the entry.
#[derive(Debug)]
pub struct FunctionData {
    pub blocks: Vec<ValueId>,
    pub params: Vec<ValueId>,
    pub locals: Vec<ValueId>,
    pub temps: Vec<ValueId>,
    pub is_extern: bool,
    pub next_seq: i64,
}

impl FunctionData {
    pub(crate) fn new(is_extern: bool) -> Self {
        FunctionData {
            blocks: Vec::new(),
            params: Vec::new(),
            locals: Vec::new(),
            temps: Vec::new(),
            is_extern,
            next_seq: 0,
        }
    }
}

/// Discriminated payload of a value.
#[derive(Debug)]
pub enum ValueKind {
    /// Single-assignment temporary produced by an instruction.
    Temp,
    /// Named, address-taken slot; only loads and stores touch it
    /// before SSA conversion.
    Local,
    /// Formal parameter of a function.
    Argument,
    /// Interned integer literal.
    ConstInt(i64),
    /// Module-scope name.
    Global(GlobalTag),
    /// Label value owning its instructions.
    Block(BlockData),
    /// Both an address constant and a container of blocks.
    Function(FunctionData),
}

/// The unit of data in the IR.
#[derive(Debug)]
pub struct Value {
    pub ty: ValueType,
    pub name: Option<String>,
    pub seq: Option<i64>,
    /// The instruction defining this value, if any.
    pub def: Option<InstId>,
    /// Instructions referencing this value.
    pub uses: BTreeSet<InstId>,
    /// Owning function, for values that belong to one.
    pub owner: Option<ValueId>,
    pub kind: ValueKind,
}

impl Value {
    pub(crate) fn new(ty: ValueType, kind: ValueKind) -> Self {
        Value {
            ty,
            name: None,
            seq: None,
            def: None,
            uses: BTreeSet::new(),
            owner: None,
            kind,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self.kind {
            ValueKind::ConstInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self.kind, ValueKind::Temp)
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ValueKind::Local)
    }

    pub fn is_argument(&self) -> bool {
        matches!(self.kind, ValueKind::Argument)
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, ValueKind::Global(_))
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, ValueKind::Block(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, ValueKind::Function(_))
    }

    /// Block payload; panics on any other kind.
    pub fn block(&self) -> &BlockData {
        match &self.kind {
            ValueKind::Block(b) => b,
            other => panic!("value is not a block: {:?}", other),
        }
    }

    pub fn block_mut(&mut self) -> &mut BlockData {
        match &mut self.kind {
            ValueKind::Block(b) => b,
            other => panic!("value is not a block: {:?}", other),
        }
    }

    /// Function payload; panics on any other kind.
    pub fn function(&self) -> &FunctionData {
        match &self.kind {
            ValueKind::Function(f) => f,
            other => panic!("value is not a function: {:?}", other),
        }
    }

    pub fn function_mut(&mut self) -> &mut FunctionData {
        match &mut self.kind {
            ValueKind::Function(f) => f,
            other => panic!("value is not a function: {:?}", other),
        }
    }

    /// Render the value the way pass logs print it.
    pub fn display(&self) -> String {
        match &self.kind {
            ValueKind::ConstInt(v) => format!("{} {}", self.ty, v),
            ValueKind::Global(_) | ValueKind::Function(_) => {
                format!("{} @{}", self.ty, self.name.as_deref().unwrap_or("?"))
            }
            ValueKind::Local | ValueKind::Argument => {
                format!("{} ${}", self.ty, self.name.as_deref().unwrap_or("?"))
            }
            ValueKind::Block(_) => format!("label .L{}", self.seq.unwrap_or(-1)),
            ValueKind::Temp => match (&self.name, self.seq) {
                (Some(name), _) => format!("{} %{}", self.ty, name),
                (None, Some(seq)) => format!("{} %{}", self.ty, seq),
                (None, None) => format!("{} %?", self.ty),
            },
        }
    }
}
