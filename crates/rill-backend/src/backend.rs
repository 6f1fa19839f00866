//! Back-end facade
//!
//! Runs the full pipeline over a caller-supplied instruction stream:
//! CFG construction, optimization, reachability and stack-depth analysis,
//! assembly. Callers that need individual stages use the component modules
//! directly.

use crate::assembler;
use crate::bytecode::CodeObject;
use crate::cfg::{analysis, ControlFlowGraph, Instruction};
use crate::error::BackendError;
use crate::optimizer::{OptimizationStats, Optimizer, MAX_ITERATIONS};
use crate::value::Value;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Run the optimizer. Off, the CFG goes to the assembler as built
    /// (unreachable blocks are still dropped).
    pub optimize: bool,
    /// Optimizer iteration cap.
    pub max_iterations: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

/// The compiler back-end.
pub struct Backend {
    options: BackendOptions,
}

impl Backend {
    /// A back-end with optimization enabled.
    pub fn new() -> Self {
        Self {
            options: BackendOptions::default(),
        }
    }

    /// A back-end with explicit options.
    pub fn with_options(options: BackendOptions) -> Self {
        Self { options }
    }

    /// Compile one code unit. Branch operands in `instructions` are
    /// absolute instruction indices; `consts` may gain entries from
    /// constant folding; `first_lineno` seeds the line table.
    pub fn compile_unit(
        &self,
        instructions: Vec<Instruction>,
        consts: &mut Vec<Value>,
        first_lineno: i32,
    ) -> Result<CodeObject, BackendError> {
        self.compile_unit_with_stats(instructions, consts, first_lineno)
            .map(|(code, _)| code)
    }

    /// Compile one code unit and report what the optimizer did.
    pub fn compile_unit_with_stats(
        &self,
        instructions: Vec<Instruction>,
        consts: &mut Vec<Value>,
        first_lineno: i32,
    ) -> Result<(CodeObject, OptimizationStats), BackendError> {
        let mut cfg = ControlFlowGraph::from_instructions(instructions)?;
        let stats = if self.options.optimize {
            Optimizer::with_iteration_cap(self.options.max_iterations)
                .optimize(&mut cfg, consts)?
        } else {
            OptimizationStats::default()
        };
        analysis::mark_reachable(&mut cfg);
        let max_stack_depth = analysis::max_stack_depth(&mut cfg)?;
        let (code, lnotab) = assembler::assemble(&mut cfg, first_lineno)?;
        Ok((
            CodeObject {
                code,
                lnotab,
                max_stack_depth,
                first_lineno,
            },
            stats,
        ))
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}
