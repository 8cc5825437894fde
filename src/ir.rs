//! Three-address-code intermediate representation
//!
//! The IR is rooted at [`IrContext`], an arena owning every value and
//! instruction of a compilation unit. Cross-references are ids;
//! nothing in the graph owns anything else.

pub mod build;
pub mod context;
pub mod from_ssa;
pub mod function;
pub mod inst;
pub mod opt;
pub mod ssa;
pub mod validate;
pub mod value;

pub use context::IrContext;
pub use inst::{BinOp, CmpOp, Inst, InstId, InstKind};
pub use value::{GlobalTag, Value, ValueId, ValueKind, ValueType};
