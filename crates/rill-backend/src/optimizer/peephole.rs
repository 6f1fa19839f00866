//! Intra-block rewrites
//!
//! Each block is scanned from its head after every applied rewrite, so a
//! single call drives the block to a local fixed point:
//! - `LOAD_CONST xN; BUILD_TUPLE N` → one `LOAD_CONST` of a folded tuple
//! - `BUILD_TUPLE n; UNPACK_SEQUENCE n` → nothing / `ROT_TWO` / `ROT_THREE; ROT_TWO`
//! - `LOAD_CONST; POP_TOP` and `DUP_TOP; POP_TOP` → nothing
//! - `BUILD_TUPLE|LIST k; POP_TOP` (k ≤ 2) → the equivalent pops
//! - `STORE_FAST n; LOAD_FAST n` → `DUP_TOP; STORE_FAST n`
//! - a conditional branch over a constant of known truthiness folds to an
//!   unconditional jump or disappears
//! - a trailing `POP_JUMP_IF_*` into its own fallthrough → `POP_TOP`
//! - a mid-block `RETURN_VALUE`/`RAISE_VARARGS` truncates the block

use super::OptimizationStats;
use crate::bytecode::Opcode;
use crate::cfg::{cfg_ensure, ControlFlowGraph};
use crate::error::BackendError;
use crate::value::Value;

/// Rewrite block `b` until no pattern applies. Returns whether anything
/// changed.
pub(crate) fn optimize_block(
    cfg: &mut ControlFlowGraph,
    b: usize,
    consts: &mut Vec<Value>,
    stats: &mut OptimizationStats,
) -> Result<bool, BackendError> {
    let mut changed = false;
    while apply_first_rewrite(cfg, b, consts, stats)? {
        changed = true;
    }
    Ok(changed)
}

/// Truthiness of the constant loaded at instruction `i`, or `None` when the
/// instruction is not a `LOAD_CONST`. A query the pool cannot answer is an
/// error, not a skipped rewrite.
fn const_truthiness(
    cfg: &ControlFlowGraph,
    consts: &[Value],
    i: usize,
) -> Result<Option<bool>, BackendError> {
    let inst = cfg.instructions()[i];
    if inst.opcode != Opcode::LoadConst {
        return Ok(None);
    }
    let index = inst.oparg as usize;
    cfg_ensure!(
        cfg,
        index < consts.len(),
        "constant index {index} out of range (pool size {})",
        consts.len()
    );
    match consts[index].truthiness() {
        Ok(known) => Ok(Some(known)),
        Err(source) => Err(BackendError::PredicateEvaluation {
            index: inst.oparg,
            source,
        }),
    }
}

fn apply_first_rewrite(
    cfg: &mut ControlFlowGraph,
    b: usize,
    consts: &mut Vec<Value>,
    stats: &mut OptimizationStats,
) -> Result<bool, BackendError> {
    let (start, end) = (cfg.blocks[b].start, cfg.blocks[b].end);
    for i in start..end {
        let inst = cfg.instructions[i];

        // Everything after a return or raise is unreachable.
        if matches!(inst.opcode, Opcode::ReturnValue | Opcode::RaiseVarargs) && i + 1 < end {
            // Re-derive flags: the producer may have delivered the opcode
            // without its terminator bit, which is how it ended up mid-block.
            cfg.instructions[i].set_opcode(inst.opcode);
            cfg.remove_instructions(i + 1, end - (i + 1));
            cfg.blocks[b].fallthrough = None;
            cfg.blocks[b].is_exit = true;
            stats.peephole_rewrites += 1;
            return Ok(true);
        }

        if i == start {
            continue;
        }
        let prev = cfg.instructions[i - 1];

        match inst.opcode {
            Opcode::LoadFast
                if prev.opcode == Opcode::StoreFast && prev.oparg == inst.oparg =>
            {
                let slot = inst.oparg;
                cfg.instructions[i - 1].set_opcode(Opcode::DupTop);
                cfg.instructions[i - 1].oparg = 0;
                cfg.instructions[i].set_opcode(Opcode::StoreFast);
                cfg.instructions[i].oparg = slot;
                stats.peephole_rewrites += 1;
                return Ok(true);
            }

            Opcode::UnpackSequence
                if prev.opcode == Opcode::BuildTuple && prev.oparg == inst.oparg =>
            {
                match inst.oparg {
                    0 | 1 => {
                        cfg.remove_instructions(i - 1, 2);
                    }
                    2 => {
                        cfg.instructions[i - 1].set_opcode(Opcode::RotTwo);
                        cfg.instructions[i - 1].oparg = 0;
                        cfg.remove_instructions(i, 1);
                    }
                    3 => {
                        cfg.instructions[i - 1].set_opcode(Opcode::RotThree);
                        cfg.instructions[i - 1].oparg = 0;
                        cfg.instructions[i].set_opcode(Opcode::RotTwo);
                        cfg.instructions[i].oparg = 0;
                    }
                    _ => continue,
                }
                stats.peephole_rewrites += 1;
                return Ok(true);
            }

            Opcode::BuildTuple => {
                if fold_tuple(cfg, b, i, consts)? {
                    stats.tuples_folded += 1;
                    return Ok(true);
                }
            }

            Opcode::PopTop => {
                if matches!(prev.opcode, Opcode::LoadConst | Opcode::DupTop) {
                    cfg.remove_instructions(i - 1, 2);
                    stats.peephole_rewrites += 1;
                    return Ok(true);
                }
                if matches!(prev.opcode, Opcode::BuildTuple | Opcode::BuildList)
                    && prev.oparg <= 2
                {
                    match prev.oparg {
                        0 => cfg.remove_instructions(i - 1, 2),
                        1 => cfg.remove_instructions(i - 1, 1),
                        _ => {
                            cfg.instructions[i - 1].set_opcode(Opcode::PopTop);
                            cfg.instructions[i - 1].oparg = 0;
                        }
                    }
                    stats.peephole_rewrites += 1;
                    return Ok(true);
                }
            }

            Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                if let Some(truthy) = const_truthiness(cfg, consts, i - 1)? {
                    let jumps_when = inst.opcode == Opcode::JumpIfTrueOrPop;
                    if truthy == jumps_when {
                        // Always taken; the constant rides along on the stack.
                        cfg.instructions[i].set_opcode(Opcode::JumpAbsolute);
                        cfg.remove_instructions(i + 1, end - (i + 1));
                        cfg.blocks[b].fallthrough = None;
                        cfg.blocks[b].is_exit = true;
                    } else {
                        // Never taken; the branch pops its operand.
                        cfg.remove_instructions(i - 1, 2);
                    }
                    stats.branches_folded += 1;
                    return Ok(true);
                }
            }

            Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => {
                if let Some(truthy) = const_truthiness(cfg, consts, i - 1)? {
                    let jumps_when = inst.opcode == Opcode::PopJumpIfTrue;
                    if truthy == jumps_when {
                        // Always taken, and the popped value was the constant.
                        cfg.instructions[i].set_opcode(Opcode::JumpAbsolute);
                        cfg.remove_instructions(i - 1, 1);
                        let end = cfg.blocks[b].end;
                        cfg.remove_instructions(i, end - i);
                        cfg.blocks[b].fallthrough = None;
                        cfg.blocks[b].is_exit = true;
                    } else {
                        cfg.remove_instructions(i - 1, 2);
                    }
                    stats.branches_folded += 1;
                    return Ok(true);
                }
                // A conditional jump into its own fallthrough only pops.
                if i == end - 1 && cfg.blocks[b].fallthrough == Some(inst.oparg as usize) {
                    cfg.instructions[i].set_opcode(Opcode::PopTop);
                    cfg.instructions[i].oparg = 0;
                    stats.peephole_rewrites += 1;
                    return Ok(true);
                }
            }

            _ => {}
        }
    }
    Ok(false)
}

/// Replace `LOAD_CONST c1 .. LOAD_CONST cn; BUILD_TUPLE n` (ending at
/// instruction `i`) with a single `LOAD_CONST` of the folded tuple, appended
/// to the pool.
fn fold_tuple(
    cfg: &mut ControlFlowGraph,
    b: usize,
    i: usize,
    consts: &mut Vec<Value>,
) -> Result<bool, BackendError> {
    let n = cfg.instructions[i].oparg as usize;
    if i - cfg.blocks[b].start < n {
        return Ok(false);
    }
    for k in (i - n)..i {
        if cfg.instructions[k].opcode != Opcode::LoadConst {
            return Ok(false);
        }
    }
    let mut items = Vec::with_capacity(n);
    for k in (i - n)..i {
        let index = cfg.instructions[k].oparg as usize;
        cfg_ensure!(
            cfg,
            index < consts.len(),
            "constant index {index} out of range (pool size {})",
            consts.len()
        );
        items.push(consts[index].clone());
    }
    let new_index =
        u32::try_from(consts.len()).map_err(|_| BackendError::ConstantPoolOverflow)?;
    consts.push(Value::tuple(items));
    let first = &mut cfg.instructions[i - n];
    first.set_opcode(Opcode::LoadConst);
    first.oparg = new_index;
    cfg.remove_instructions(i - n + 1, n);
    Ok(true)
}
