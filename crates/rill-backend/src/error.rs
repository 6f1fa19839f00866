//! Back-end error type
//!
//! The pipeline reports three kinds of failure:
//! - `ConstantPoolOverflow` — a folded constant would not be addressable
//! - `PredicateEvaluation` — a compile-time truthiness query could not be
//!   answered (the optimizer never guesses)
//! - `InvariantViolation` — the graph contradicts its own structural rules,
//!   which means the instruction producer (or the back-end itself) has a bug
//!
//! In debug builds an invariant violation panics after dumping the CFG; in
//! release builds it surfaces as an ordinary error without the dump.

use crate::value::TruthinessError;
use thiserror::Error;

/// Error raised by any stage of the back-end pipeline.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Appending a folded constant would exceed the operand width.
    #[error("constant pool overflow: folded constant is not addressable by a u32 operand")]
    ConstantPoolOverflow,

    /// A constant's truthiness query failed during branch folding.
    #[error("cannot decide truthiness of constant {index}: {source}")]
    PredicateEvaluation {
        /// Pool index of the constant being queried.
        index: u32,
        #[source]
        source: TruthinessError,
    },

    /// The control-flow graph violated a structural invariant.
    #[error("control-flow graph invariant violated: {detail}")]
    InvariantViolation {
        /// Which invariant failed, in the words of the check that caught it.
        detail: String,
    },
}
