//! Reachability and stack-depth analysis
//!
//! Both passes sweep the block array driven by the per-block `grey` bit
//! rather than an auxiliary worklist; backward edges re-grey their target
//! and force another sweep. Entry depths are set exactly once and asserted
//! equal on every later join, so the depth pass reaches a fixed point.

use super::{cfg_ensure, ControlFlowGraph};
use crate::error::BackendError;

/// Recompute `is_reachable` for every block from block 0.
pub fn mark_reachable(cfg: &mut ControlFlowGraph) {
    if cfg.blocks.is_empty() {
        return;
    }
    cfg.blocks[0].grey = true;
    cfg.blocks[0].is_reachable = true;
    for blk in cfg.blocks.iter_mut().skip(1) {
        blk.grey = false;
        blk.is_reachable = false;
    }
    let mut rescan = true;
    while rescan {
        rescan = false;
        for b in 0..cfg.blocks.len() {
            if !cfg.blocks[b].grey {
                continue;
            }
            cfg.blocks[b].grey = false;
            if let Some(f) = cfg.blocks[b].fallthrough {
                if !cfg.blocks[f].is_reachable {
                    cfg.blocks[f].is_reachable = true;
                    cfg.blocks[f].grey = true;
                    if f < b {
                        rescan = true;
                    }
                }
            }
            let blk = &cfg.blocks[b];
            if !blk.is_empty() {
                let last = &cfg.instructions[blk.end - 1];
                if last.is_branch() {
                    let t = last.oparg as usize;
                    if !cfg.blocks[t].is_reachable {
                        cfg.blocks[t].is_reachable = true;
                        cfg.blocks[t].grey = true;
                        if t < b {
                            // Backwards edge, so this sweep missed it.
                            rescan = true;
                        }
                    }
                }
            }
        }
    }
}

/// Propagate entry stack depths across every edge and return the maximum
/// depth observed at any reachable instruction.
///
/// Block 0 is seeded at depth 0. A branch edge applies the jump-taken
/// effect, the fallthrough edge the not-taken effect. Underflow against an
/// opcode's minimum input and depth disagreement on a join are invariant
/// violations: the producer built an inconsistent stream.
pub fn max_stack_depth(cfg: &mut ControlFlowGraph) -> Result<u32, BackendError> {
    cfg.sanity_check()?;
    for blk in &mut cfg.blocks {
        blk.entry_depth = None;
        blk.grey = false;
    }
    cfg.blocks[0].entry_depth = Some(0);
    cfg.blocks[0].grey = true;

    let mut max_depth: i32 = 0;
    loop {
        let mut progressed = false;
        let mut pending = false;
        for b in 0..cfg.blocks.len() {
            if !cfg.blocks[b].is_reachable {
                continue;
            }
            let Some(mut depth) = cfg.blocks[b].entry_depth else {
                // Depth arrives from a predecessor later in this sweep or
                // the next one.
                pending = true;
                continue;
            };
            if !cfg.blocks[b].grey {
                continue;
            }
            cfg.blocks[b].grey = false;
            progressed = true;

            let (start, end) = (cfg.blocks[b].start, cfg.blocks[b].end);
            for i in start..end {
                if depth > max_depth {
                    max_depth = depth;
                }
                let inst = cfg.instructions[i];
                cfg_ensure!(
                    cfg,
                    depth >= inst.opcode.stack_input(inst.oparg),
                    "stack underflow at instruction {i} ({}): depth {depth}, needs {}",
                    inst.opcode,
                    inst.opcode.stack_input(inst.oparg)
                );
                if inst.is_branch() {
                    let target_depth = depth + inst.opcode.stack_effect(inst.oparg, true);
                    let t = inst.oparg as usize;
                    match cfg.blocks[t].entry_depth {
                        Some(existing) => {
                            cfg_ensure!(
                                cfg,
                                existing == target_depth,
                                "inconsistent stack depth on join at block {t}: {existing} vs {target_depth}"
                            );
                        }
                        None => {
                            cfg.blocks[t].entry_depth = Some(target_depth);
                            cfg.blocks[t].grey = true;
                        }
                    }
                }
                depth += inst.opcode.stack_effect(inst.oparg, false);
                cfg_ensure!(
                    cfg,
                    depth >= 0,
                    "stack underflow after instruction {i} ({})",
                    inst.opcode
                );
            }
            if let Some(f) = cfg.blocks[b].fallthrough {
                match cfg.blocks[f].entry_depth {
                    Some(existing) => {
                        cfg_ensure!(
                            cfg,
                            existing == depth,
                            "inconsistent stack depth on fallthrough into block {f}: {existing} vs {depth}"
                        );
                    }
                    None => {
                        cfg.blocks[f].entry_depth = Some(depth);
                        cfg.blocks[f].grey = true;
                    }
                }
            }
        }
        if progressed {
            continue;
        }
        cfg_ensure!(
            cfg,
            !pending,
            "a reachable block never acquired an entry depth"
        );
        break;
    }
    Ok(max_depth as u32)
}
