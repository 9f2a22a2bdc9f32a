//! Error taxonomy shared by the tensor engine, the evaluator and the toolkit.
//!
//! Every failure is a hard failure: it aborts the current evaluation step and is
//! handed back to the caller unchanged. Nothing in this crate retries or recovers.

use thiserror::Error;

/// Errors raised by graph construction, backward passes and evaluation.
#[derive(Error, Debug)]
pub enum Error {
    /// A scope lookup found no binding for the name.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    /// No dispatch rule exists for the operator and operand types.
    #[error("unsupported operands for '{op}': {left} and {right}")]
    UnsupportedOperands {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    /// Incompatible dimensions (matmul, elementwise ops, ragged rows, reshapes).
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A row or column access beyond the tensor bounds.
    #[error("index {index} out of range for bound {bound}")]
    IndexOutOfRange { index: usize, bound: usize },

    /// A parent edge expired before backward consumed it.
    ///
    /// This always signals a lifetime bug in the caller (usually a cleared tape
    /// or a dropped intermediate) and is never skipped.
    #[error("dangling graph edge: a parent of tensor #{node} was freed before backward")]
    DanglingGraphEdge { node: u64 },

    /// Backward reached an operation with no gradient rule.
    #[error("no gradient rule for operation '{0}'")]
    UnknownOperationTag(String),

    /// `exit_scope` was called with only the global scope left.
    #[error("cannot exit the global scope")]
    GlobalScopeExit,

    /// A slice was requested with a step of zero.
    #[error("slice step cannot be zero")]
    ZeroSliceStep,

    /// Scalar (non-tensor) division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Integer arithmetic left the `i64` range.
    #[error("integer overflow in '{0}'")]
    IntegerOverflow(String),

    /// A matrix literal could not be parsed.
    #[error("invalid matrix literal: {0}")]
    Parse(&'static str),

    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A checkpoint file is malformed or does not match the target parameters.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl Error {
    pub(crate) fn shape(expected: (usize, usize), got: (usize, usize)) -> Self {
        Self::ShapeMismatch {
            expected: vec![expected.0, expected.1],
            got: vec![got.0, got.1],
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
