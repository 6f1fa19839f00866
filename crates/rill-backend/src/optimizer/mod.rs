//! CFG optimizer
//!
//! Two families of rewrites run to a fixed point, capped at a small
//! iteration bound:
//! - inter-block jump rewrites (threading, conditional collapse, sense
//!   flipping, tail duplication) — tried first on each block;
//! - intra-block peephole rewrites (tuple folding, pop elimination,
//!   conditional-branch folding) — only when no jump rewrite fired.
//!
//! After every iteration that changed the graph, reachability is
//! recomputed; the analyzer never sees stale marks. A final pass promotes
//! unconditional jumps into fallthrough links where that merges two runs.

mod jumps;
mod peephole;

use serde::Serialize;

use crate::cfg::{analysis, ControlFlowGraph};
use crate::error::BackendError;
use crate::value::Value;

/// Upper bound on optimizer iterations; bounds worst-case work on
/// pathological graphs.
pub const MAX_ITERATIONS: usize = 12;

/// Exit blocks at most this long are cloned into their predecessor instead
/// of being jumped to.
pub const MAX_LENGTH_FOR_DUPLICATING: usize = 6;

/// Counters describing one optimizer run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct OptimizationStats {
    pub passes_run: usize,
    pub instructions_before: usize,
    pub instructions_after: usize,
    pub blocks_before: usize,
    pub blocks_after: usize,
    /// Intra-block pattern rewrites, excluding the two folds below.
    pub peephole_rewrites: usize,
    pub tuples_folded: usize,
    pub branches_folded: usize,
    /// Inter-block retargets and collapses.
    pub jump_rewrites: usize,
    pub blocks_duplicated: usize,
    pub jumps_promoted: usize,
}

impl OptimizationStats {
    /// Render the counters as JSON for tooling.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// The optimizer driver.
pub struct Optimizer {
    max_iterations: usize,
}

impl Optimizer {
    pub fn new() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
        }
    }

    /// Override the iteration cap. Useful for tests that want to observe a
    /// single pass.
    pub fn with_iteration_cap(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    /// Optimize `cfg` in place. New constants produced by folding are
    /// appended to `consts`; existing entries are never touched.
    pub fn optimize(
        &self,
        cfg: &mut ControlFlowGraph,
        consts: &mut Vec<Value>,
    ) -> Result<OptimizationStats, BackendError> {
        let mut stats = OptimizationStats {
            instructions_before: cfg.instruction_count(),
            blocks_before: cfg.block_count(),
            ..OptimizationStats::default()
        };

        for _ in 0..self.max_iterations {
            analysis::mark_reachable(cfg);
            let mut changed = false;
            let mut b = 0;
            // Tail duplication appends blocks mid-pass; they are visited in
            // the same sweep.
            while b < cfg.block_count() {
                if cfg.blocks()[b].is_reachable {
                    if jumps::optimize_block_jump(cfg, b, &mut stats)? {
                        changed = true;
                    } else if peephole::optimize_block(cfg, b, consts, &mut stats)? {
                        changed = true;
                    }
                }
                b += 1;
            }
            stats.passes_run += 1;
            if !changed {
                break;
            }
        }

        analysis::mark_reachable(cfg);
        stats.jumps_promoted = jumps::promote_fallthroughs(cfg)?;
        analysis::mark_reachable(cfg);

        stats.instructions_after = cfg.instruction_count();
        stats.blocks_after = cfg.block_count();
        Ok(stats)
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}
