//! Rill bytecode back-end
//!
//! The code-generation pipeline of the Rill runtime:
//! - control-flow-graph construction over a linear instruction stream
//! - peephole and flow optimization on the graph
//! - reachability and operand-stack-depth analysis
//! - two-pass assembly into fixed-width code units plus a compressed
//!   line-number table
//!
//! The front-end (parser, symbol tables, code-unit builder) and the
//! execution engine live elsewhere; this crate consumes resolved
//! instruction streams and produces [`CodeObject`]s.

/// Back-end version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod assembler;
pub mod backend;
pub mod bytecode;
pub mod cfg;
pub mod error;
pub mod optimizer;
pub mod value;

// Re-export commonly used types
pub use backend::{Backend, BackendOptions};
pub use bytecode::{
    disassemble, instrsize, validate, CodeObject, Opcode, ValidationError, ValidationErrorKind,
    BYTECODE_VERSION, CODE_UNIT_BYTES,
};
pub use cfg::{BasicBlock, ControlFlowGraph, Instruction};
pub use error::BackendError;
pub use optimizer::{OptimizationStats, Optimizer};
pub use value::{ForeignConst, TruthinessError, Value};
