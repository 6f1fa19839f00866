//! Inter-block rewrites
//!
//! Each block ending in a branch is examined against its target:
//! - branches into empty blocks follow the fallthrough chain to the real
//!   target;
//! - jump-to-jump chains are threaded;
//! - `JUMP_IF_*_OR_POP` into the same kind (or an unconditional jump)
//!   retargets, into the opposite kind collapses to a `POP_JUMP_IF_*`;
//! - a `POP_JUMP_IF_*` falling into a lone unconditional jump swaps sense
//!   and targets when that trades a long duplication for a short one;
//! - an unconditional jump into a short exit block clones the block into
//!   the fallthrough slot (tail duplication).
//!
//! The final fallthrough-promotion pass turns the surviving unconditional
//! jumps into fallthrough links wherever that merges two runs without
//! creating a cycle or unseating the entry run.

use super::{OptimizationStats, MAX_LENGTH_FOR_DUPLICATING};
use crate::bytecode::Opcode;
use crate::cfg::{cfg_ensure, ControlFlowGraph};
use crate::error::BackendError;

/// A block eligible for tail duplication: a short exit whose terminator is
/// not itself a branch. The clone shares the instruction range, so a
/// trailing branch would need one width per emission site.
fn duplicable(cfg: &ControlFlowGraph, b: usize) -> bool {
    let blk = &cfg.blocks()[b];
    blk.is_exit
        && !blk.is_empty()
        && blk.len() <= MAX_LENGTH_FOR_DUPLICATING
        && !cfg.instructions()[blk.end - 1].is_branch()
}

/// Apply at most one jump rewrite to block `b`. Returns whether the graph
/// changed.
pub(crate) fn optimize_block_jump(
    cfg: &mut ControlFlowGraph,
    b: usize,
    stats: &mut OptimizationStats,
) -> Result<bool, BackendError> {
    let blk = cfg.blocks[b];
    if blk.is_empty() {
        return Ok(false);
    }
    let last_i = blk.end - 1;
    let last = cfg.instructions[last_i];
    if !last.is_branch() {
        return Ok(false);
    }
    let t = last.oparg as usize;
    cfg_ensure!(cfg, t < cfg.blocks.len(), "branch targets missing block {t}");
    if t == b {
        return Ok(false);
    }

    // Empty blocks are transparent; aim at the first real instruction.
    if cfg.blocks[t].is_empty() {
        let resolved = cfg.resolve_nonempty(t)?;
        if resolved != t {
            cfg.instructions[last_i].oparg = resolved as u32;
            stats.jump_rewrites += 1;
            return Ok(true);
        }
        return Ok(false);
    }

    let t0 = cfg.instructions[cfg.blocks[t].start];
    match last.opcode {
        Opcode::JumpForward | Opcode::JumpAbsolute => {
            if t0.opcode.is_unconditional_jump() {
                let new_t = t0.oparg as usize;
                if new_t != t || last.opcode == Opcode::JumpForward {
                    cfg.instructions[last_i].set_opcode(Opcode::JumpAbsolute);
                    cfg.instructions[last_i].oparg = new_t as u32;
                    stats.jump_rewrites += 1;
                    return Ok(true);
                }
            }
            if last.opcode == Opcode::JumpAbsolute && duplicable(cfg, t) {
                let clone = cfg.copy_block(t);
                cfg.remove_instructions(last_i, 1);
                cfg.blocks[b].fallthrough = Some(clone);
                cfg.blocks[b].is_exit = false;
                stats.blocks_duplicated += 1;
                return Ok(true);
            }
        }

        Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
            let same_kind = t0.opcode == last.opcode;
            if same_kind || t0.opcode == Opcode::JumpAbsolute {
                // Same test over the same value, or a plain trampoline:
                // follow it.
                if t0.oparg != last.oparg {
                    cfg.instructions[last_i].oparg = t0.oparg;
                    stats.jump_rewrites += 1;
                    return Ok(true);
                }
            } else if is_opposite_or_pop(last.opcode, t0.opcode) && cfg.blocks[t].len() == 1 {
                // The second test is known to fail and pops; jump straight
                // past it.
                let landing = cfg.blocks[t].fallthrough;
                let Some(landing) = landing else {
                    return Err(cfg
                        .invariant_failure(format!("conditional block {t} has no fallthrough")));
                };
                let collapsed = if last.opcode == Opcode::JumpIfFalseOrPop {
                    Opcode::PopJumpIfFalse
                } else {
                    Opcode::PopJumpIfTrue
                };
                cfg.instructions[last_i].set_opcode(collapsed);
                cfg.instructions[last_i].oparg = landing as u32;
                stats.jump_rewrites += 1;
                return Ok(true);
            }
        }

        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
            if t0.opcode == Opcode::JumpAbsolute {
                if t0.oparg != last.oparg {
                    cfg.instructions[last_i].oparg = t0.oparg;
                    stats.jump_rewrites += 1;
                    return Ok(true);
                }
            }
            // Sense flip: the fallthrough is a lone unconditional jump to a
            // block that is worse to duplicate than the branch target.
            if let Some(f) = cfg.blocks[b].fallthrough {
                let fb = cfg.blocks[f];
                if fb.len() == 1 && cfg.instructions[fb.start].opcode == Opcode::JumpAbsolute {
                    let g = cfg.instructions[fb.start].oparg as usize;
                    cfg_ensure!(cfg, g < cfg.blocks.len(), "jump targets missing block {g}");
                    if g != t
                        && duplicable(cfg, t)
                        && (!duplicable(cfg, g) || cfg.blocks[t].len() < cfg.blocks[g].len())
                    {
                        let flipped = if last.opcode == Opcode::PopJumpIfFalse {
                            Opcode::PopJumpIfTrue
                        } else {
                            Opcode::PopJumpIfFalse
                        };
                        cfg.instructions[last_i].set_opcode(flipped);
                        cfg.instructions[last_i].oparg = g as u32;
                        cfg.instructions[fb.start].oparg = t as u32;
                        stats.jump_rewrites += 1;
                        return Ok(true);
                    }
                }
            }
        }

        // FOR_ITER and the setup family pin their targets.
        _ => {}
    }
    Ok(false)
}

fn is_opposite_or_pop(a: Opcode, b: Opcode) -> bool {
    matches!(
        (a, b),
        (Opcode::JumpIfFalseOrPop, Opcode::JumpIfTrueOrPop)
            | (Opcode::JumpIfTrueOrPop, Opcode::JumpIfFalseOrPop)
    )
}

/// Turn unconditional jumps into fallthrough links where the target heads a
/// different run and nothing else falls into it. Returns the number of
/// jumps removed.
pub(crate) fn promote_fallthroughs(
    cfg: &mut ControlFlowGraph,
) -> Result<usize, BackendError> {
    let n = cfg.blocks.len();
    let mut is_fallthrough_target = vec![false; n];
    for b in 0..n {
        if let Some(f) = cfg.blocks[b].fallthrough {
            is_fallthrough_target[f] = true;
        }
    }
    // Colour each run by its head so a jump within one run is recognisable:
    // promoting it would close a fallthrough cycle.
    let mut colour: Vec<usize> = (0..n).collect();
    for head in 0..n {
        if is_fallthrough_target[head] {
            continue;
        }
        let mut x = head;
        let mut steps = 0;
        loop {
            colour[x] = head;
            cfg_ensure!(cfg, steps <= n, "fallthrough cycle at block {x}");
            steps += 1;
            match cfg.blocks[x].fallthrough {
                Some(f) => x = f,
                None => break,
            }
        }
    }

    let mut promoted = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for b in 0..n {
            let blk = cfg.blocks[b];
            if !blk.is_reachable || blk.is_empty() {
                continue;
            }
            let last_i = blk.end - 1;
            let last = cfg.instructions[last_i];
            if !last.opcode.is_unconditional_jump() {
                continue;
            }
            let t = last.oparg as usize;
            if t == 0 || is_fallthrough_target[t] || colour[t] == colour[b] {
                continue;
            }
            cfg.remove_instructions(last_i, 1);
            cfg.blocks[b].fallthrough = Some(t);
            cfg.blocks[b].is_exit = false;
            is_fallthrough_target[t] = true;
            // The target's run now belongs to ours.
            let mut x = t;
            loop {
                colour[x] = colour[b];
                match cfg.blocks[x].fallthrough {
                    Some(f) => x = f,
                    None => break,
                }
            }
            promoted += 1;
            changed = true;
        }
    }
    Ok(promoted)
}
