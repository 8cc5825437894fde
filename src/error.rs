//! Compilation error implementation

use crate::ast::{Span, TypeVar};

use thiserror::Error;

/// Fatal errors raised by the code generation core.
///
/// No error is recoverable: the pipeline aborts on the first failure
/// and produces no partial output.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An invariant was violated during lowering.
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    /// A generic call could not be instantiated at a concrete type.
    #[error(transparent)]
    Monomorphization(#[from] MonomorphizationError),
}

/// Any invariant violation reached during lowering: a missing layout,
/// an unresolved member, an untyped value reaching the machine IR, a
/// compile-time division by zero, or a validator failure.
#[derive(Debug, Error)]
#[error("codegen error: {0}")]
pub struct CodegenError(pub String);

impl CodegenError {
    pub fn new<S: Into<String>>(description: S) -> Self {
        CodegenError(description.into())
    }
}

/// A generic call whose type arguments remain unresolved at the
/// instantiation site.
#[derive(Debug, Error)]
#[error("cannot instantiate generic call at {span}: unresolved type variables {vars:?}")]
pub struct MonomorphizationError {
    /// Location of the offending call.
    pub span: Span,
    /// The type variables left without a concrete assignment.
    pub vars: Vec<TypeVar>,
}

impl CompileError {
    /// Flag whether this failure came from the monomorphizer.
    pub const fn is_monomorphization(&self) -> bool {
        matches!(self, Self::Monomorphization(_))
    }
}
