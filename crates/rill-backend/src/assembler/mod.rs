//! Two-pass bytecode assembler
//!
//! Pass one orders the reachable blocks (every block directly followed by
//! its fallthrough) and solves the branch-size fixed point: branches start
//! at their upper-bound width and monotonically shrink as offsets tighten,
//! so the loop terminates. Pass two walks the order and emits fixed-width
//! code units plus the delta-encoded line table.
//!
//! Offsets and sizes are in code units (2 bytes each); branch operands are
//! byte distances. A forward `JUMP_ABSOLUTE` is emitted as `JUMP_FORWARD`
//! because the relative encoding is usually shorter.

use crate::bytecode::{instrsize, Opcode, CODE_UNIT_BYTES};
use crate::cfg::{cfg_ensure, ControlFlowGraph};
use crate::error::BackendError;

const DEFAULT_CODE_CAPACITY: usize = 128;
const DEFAULT_LNOTAB_CAPACITY: usize = 16;

/// Growing output buffers plus the line-table cursor.
struct AssemblerState {
    code: Vec<u8>,
    lnotab: Vec<u8>,
    /// Write position in code units.
    offset: u32,
    /// Line of the most recent line-table entry.
    line: i32,
    /// Code-unit offset of the most recent line-table entry.
    line_start: u32,
}

impl AssemblerState {
    fn new(first_lineno: i32) -> Self {
        Self {
            code: Vec::with_capacity(DEFAULT_CODE_CAPACITY),
            lnotab: Vec::with_capacity(DEFAULT_LNOTAB_CAPACITY),
            offset: 0,
            line: first_lineno,
            line_start: 0,
        }
    }

    fn push_line_delta(&mut self, byte_delta: u8, line_delta: i8) {
        self.lnotab.push(byte_delta);
        self.lnotab.push(line_delta as u8);
    }

    /// Record that the instruction about to be emitted belongs to `line`.
    /// Spans wider than 255 bytes or 127 lines are split into continuation
    /// pairs. Synthetic instructions (negative line) inherit the current
    /// line.
    fn emit_line(&mut self, line: i32) {
        if line < 0 || line == self.line {
            return;
        }
        let mut byte_delta = (self.offset - self.line_start) * CODE_UNIT_BYTES;
        let mut line_delta = line - self.line;
        while byte_delta > 255 {
            self.push_line_delta(255, 0);
            byte_delta -= 255;
        }
        while line_delta > 127 {
            self.push_line_delta(byte_delta as u8, 127);
            byte_delta = 0;
            line_delta -= 127;
        }
        while line_delta < -128 {
            self.push_line_delta(byte_delta as u8, -128);
            byte_delta = 0;
            line_delta += 128;
        }
        if byte_delta != 0 || line_delta != 0 {
            self.push_line_delta(byte_delta as u8, line_delta as i8);
        }
        self.line = line;
        self.line_start = self.offset;
    }

    /// Emit `size` code units: `EXTENDED_ARG` prefixes most-significant
    /// byte first, then the instruction itself with the low byte.
    fn write_op_arg(&mut self, opcode: Opcode, oparg: u32, size: u8) {
        for shift in (1..size).rev() {
            self.code.push(Opcode::ExtendedArg as u8);
            self.code.push((oparg >> (8 * shift)) as u8);
        }
        self.code.push(opcode as u8);
        self.code.push(oparg as u8);
        self.offset += size as u32;
    }
}

/// Assemble an analyzed, optimized graph into `(bytecode, lnotab)`.
pub fn assemble(
    cfg: &mut ControlFlowGraph,
    first_lineno: i32,
) -> Result<(Vec<u8>, Vec<u8>), BackendError> {
    cfg.sanity_check()?;
    let order = emission_order(cfg)?;
    compute_offsets(cfg, &order)?;

    let mut a = AssemblerState::new(first_lineno);
    for &b in &order {
        let (start, end) = (cfg.blocks[b].start, cfg.blocks[b].end);
        for i in start..end {
            let inst = cfg.instructions[i];
            let oparg = compute_oparg(cfg, b, i)?;
            cfg_ensure!(
                cfg,
                instrsize(oparg) == inst.size,
                "instruction {i} was sized {} code units but operand {oparg} needs {}",
                inst.size,
                instrsize(oparg)
            );
            let opcode = if inst.opcode == Opcode::JumpAbsolute && is_forward_branch(cfg, b, i) {
                Opcode::JumpForward
            } else {
                inst.opcode
            };
            a.emit_line(inst.line);
            a.write_op_arg(opcode, oparg, inst.size);
        }
    }
    Ok((a.code, a.lnotab))
}

/// Produce the emission order: every reachable block exactly once, each
/// block directly followed by its fallthrough. Runs are started at blocks
/// that no reachable block falls into, in index order.
fn emission_order(cfg: &mut ControlFlowGraph) -> Result<Vec<usize>, BackendError> {
    // Mark fallthrough targets with the grey bit; they are mid-run.
    for blk in &mut cfg.blocks {
        blk.grey = false;
    }
    for b in 0..cfg.blocks.len() {
        if !cfg.blocks[b].is_reachable {
            continue;
        }
        if let Some(f) = cfg.blocks[b].fallthrough {
            cfg_ensure!(
                cfg,
                !cfg.blocks[f].grey,
                "block {f} is the fallthrough of two blocks"
            );
            cfg.blocks[f].grey = true;
        }
    }
    let mut order = Vec::with_capacity(cfg.blocks.len());
    for b in 0..cfg.blocks.len() {
        if !cfg.blocks[b].is_reachable || cfg.blocks[b].grey {
            continue;
        }
        order.push(b);
        let mut x = b;
        while let Some(f) = cfg.blocks[x].fallthrough {
            order.push(f);
            cfg_ensure!(
                cfg,
                order.len() <= cfg.blocks.len(),
                "fallthrough cycle while ordering blocks"
            );
            x = f;
        }
    }
    if cfg!(debug_assertions) {
        check_block_order(cfg, &order)?;
    }
    Ok(order)
}

/// Consistency check over an emission order: starts at the entry, visits
/// each block once, places fallthroughs adjacently, covers every reachable
/// block.
fn check_block_order(cfg: &mut ControlFlowGraph, order: &[usize]) -> Result<(), BackendError> {
    cfg_ensure!(
        cfg,
        order.first() == Some(&0),
        "emission order does not start at the entry block"
    );
    for blk in &mut cfg.blocks {
        blk.grey = false;
    }
    for (pos, &b) in order.iter().enumerate() {
        cfg_ensure!(cfg, b < cfg.blocks.len(), "ordered block {b} does not exist");
        cfg_ensure!(cfg, !cfg.blocks[b].grey, "block {b} ordered twice");
        cfg.blocks[b].grey = true;
        if let Some(f) = cfg.blocks[b].fallthrough {
            cfg_ensure!(
                cfg,
                order.get(pos + 1) == Some(&f),
                "block {b} is not followed by its fallthrough {f}"
            );
        }
    }
    for b in 0..cfg.blocks.len() {
        cfg_ensure!(
            cfg,
            !cfg.blocks[b].is_reachable || cfg.blocks[b].grey,
            "reachable block {b} missing from the emission order"
        );
    }
    Ok(())
}

/// Upper-bound sizing: every branch gets the width of the largest operand
/// any branch could need, every other instruction its fixed width. Offsets
/// follow by prefix sum.
fn initialize_offsets(cfg: &mut ControlFlowGraph, order: &[usize]) {
    let mut upper: u64 = 0;
    for &b in order {
        for i in cfg.blocks[b].start..cfg.blocks[b].end {
            let inst = &cfg.instructions[i];
            upper += if inst.is_branch() {
                4
            } else {
                instrsize(inst.oparg) as u64
            };
        }
    }
    let max_operand = (upper * CODE_UNIT_BYTES as u64).min(u32::MAX as u64) as u32;
    let max_branch_size = instrsize(max_operand);

    let mut offset: u32 = 0;
    for &b in order {
        let (start, end) = (cfg.blocks[b].start, cfg.blocks[b].end);
        cfg.blocks[b].offset = offset;
        for i in start..end {
            let size = if cfg.instructions[i].is_branch() {
                max_branch_size
            } else {
                instrsize(cfg.instructions[i].oparg)
            };
            cfg.instructions[i].size = size;
            offset += size as u32;
        }
        cfg.blocks[b].size = offset - cfg.blocks[b].offset;
    }
}

/// Iterate to the branch-size fixed point. Walking in emission order, each
/// block's offset absorbs the shrinkage accumulated so far; the trailing
/// branch is then resized against the current offsets. Sizes never grow,
/// so the loop terminates.
fn compute_offsets(cfg: &mut ControlFlowGraph, order: &[usize]) -> Result<(), BackendError> {
    initialize_offsets(cfg, order);
    loop {
        let mut adjust: i64 = 0;
        for &b in order {
            cfg.blocks[b].offset = (cfg.blocks[b].offset as i64 + adjust) as u32;
            let blk = cfg.blocks[b];
            if blk.is_empty() {
                continue;
            }
            let last_i = blk.end - 1;
            if !cfg.instructions[last_i].is_branch() {
                continue;
            }
            let new_size = instrsize(branch_oparg(cfg, b)?);
            let old_size = cfg.instructions[last_i].size;
            if old_size > new_size {
                adjust -= (old_size - new_size) as i64;
                cfg.blocks[b].size -= (old_size - new_size) as u32;
                cfg.instructions[last_i].size = new_size;
            }
        }
        if adjust == 0 {
            break;
        }
    }
    if cfg!(debug_assertions) {
        offset_sanity_check(cfg, order)?;
    }
    Ok(())
}

fn is_forward_branch(cfg: &ControlFlowGraph, b: usize, i: usize) -> bool {
    let blk = &cfg.blocks[b];
    let target = &cfg.blocks[cfg.instructions[i].oparg as usize];
    target.offset >= blk.offset + blk.size
}

/// The operand a trailing branch encodes, given the current offsets:
/// a byte distance from the end of the branch for the relative family, an
/// absolute byte address for the rest. A forward `JUMP_ABSOLUTE` takes the
/// relative form because it is emitted as `JUMP_FORWARD`.
fn branch_oparg(cfg: &ControlFlowGraph, b: usize) -> Result<u32, BackendError> {
    let blk = cfg.blocks[b];
    let inst = cfg.instructions[blk.end - 1];
    debug_assert!(inst.is_branch());
    let target_offset = cfg.blocks[inst.oparg as usize].offset;
    let relative =
        inst.opcode.uses_relative_offset() || (inst.opcode == Opcode::JumpAbsolute && is_forward_branch(cfg, b, blk.end - 1));
    if relative {
        let from = blk.offset + blk.size;
        cfg_ensure!(
            cfg,
            target_offset >= from,
            "relative {} at block {b} would jump backwards",
            inst.opcode
        );
        Ok((target_offset - from) * CODE_UNIT_BYTES)
    } else {
        Ok(target_offset * CODE_UNIT_BYTES)
    }
}

fn compute_oparg(cfg: &ControlFlowGraph, b: usize, i: usize) -> Result<u32, BackendError> {
    let inst = cfg.instructions[i];
    if inst.is_branch() {
        debug_assert_eq!(i, cfg.blocks[b].end - 1);
        branch_oparg(cfg, b)
    } else {
        Ok(inst.oparg)
    }
}

/// Re-derive every offset from scratch and compare with the solver's
/// results.
fn offset_sanity_check(cfg: &mut ControlFlowGraph, order: &[usize]) -> Result<(), BackendError> {
    check_block_order(cfg, order)?;
    let mut offset: u32 = 0;
    for &b in order {
        let blk = cfg.blocks[b];
        cfg_ensure!(
            cfg,
            offset == blk.offset,
            "block {b} placed at {} but walk reaches {offset}",
            blk.offset
        );
        for i in blk.start..blk.end {
            let inst = cfg.instructions[i];
            let oparg = compute_oparg(cfg, b, i)?;
            cfg_ensure!(
                cfg,
                inst.size == instrsize(oparg),
                "instruction {i} sized {} but operand {oparg} needs {}",
                inst.size,
                instrsize(oparg)
            );
            offset += inst.size as u32;
        }
        cfg_ensure!(
            cfg,
            offset == blk.offset + blk.size,
            "block {b} size disagrees with its instructions"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{analysis, Instruction};

    fn instr(opcode: Opcode, oparg: u32) -> Instruction {
        Instruction::new(opcode, oparg, 1)
    }

    fn assemble_stream(stream: Vec<Instruction>) -> (Vec<u8>, Vec<u8>) {
        let mut cfg = ControlFlowGraph::from_instructions(stream).unwrap();
        analysis::mark_reachable(&mut cfg);
        analysis::max_stack_depth(&mut cfg).unwrap();
        assemble(&mut cfg, 1).unwrap()
    }

    /// Decode `(opcode, resolved_arg)` pairs, folding EXTENDED_ARG.
    fn decode(code: &[u8]) -> Vec<(Opcode, u32)> {
        let mut out = Vec::new();
        let mut ext: u32 = 0;
        for unit in code.chunks(2) {
            let opcode = Opcode::try_from(unit[0]).unwrap();
            if opcode == Opcode::ExtendedArg {
                ext = (ext << 8) | unit[1] as u32;
            } else {
                out.push((opcode, (ext << 8) | unit[1] as u32));
                ext = 0;
            }
        }
        out
    }

    #[test]
    fn test_straight_line_emission() {
        let (code, _) = assemble_stream(vec![
            instr(Opcode::LoadConst, 0),
            instr(Opcode::LoadConst, 1),
            instr(Opcode::BinaryAdd, 0),
            instr(Opcode::ReturnValue, 0),
        ]);
        assert_eq!(code.len(), 8);
        assert_eq!(
            decode(&code),
            vec![
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ]
        );
    }

    #[test]
    fn test_wide_operand_gets_extended_arg() {
        let (code, _) = assemble_stream(vec![
            instr(Opcode::LoadConst, 0x1234),
            instr(Opcode::ReturnValue, 0),
        ]);
        assert_eq!(code.len(), 6);
        assert_eq!(code[0], Opcode::ExtendedArg as u8);
        assert_eq!(code[1], 0x12);
        assert_eq!(code[2], Opcode::LoadConst as u8);
        assert_eq!(code[3], 0x34);
        assert_eq!(
            decode(&code),
            vec![(Opcode::LoadConst, 0x1234), (Opcode::ReturnValue, 0)]
        );
    }

    #[test]
    fn test_forward_absolute_becomes_jump_forward() {
        // An if/else diamond: the then-arm's JUMP_ABSOLUTE to the join is
        // forward, so it is re-encoded as JUMP_FORWARD.
        let (code, _) = assemble_stream(vec![
            instr(Opcode::LoadFast, 0),
            instr(Opcode::PopJumpIfFalse, 4),
            instr(Opcode::LoadConst, 0),
            instr(Opcode::JumpAbsolute, 6),
            instr(Opcode::LoadConst, 1),
            instr(Opcode::Nop, 0),
            instr(Opcode::ReturnValue, 0),
        ]);
        let decoded = decode(&code);
        assert_eq!(decoded[3].0, Opcode::JumpForward);
        // It skips the two-unit else arm: 2 units * 2 bytes.
        assert_eq!(decoded[3].1, 4);
        // The conditional stays absolute: it targets unit 4, byte 8.
        assert_eq!(decoded[1].0, Opcode::PopJumpIfFalse);
        assert_eq!(decoded[1].1, 8);
    }

    #[test]
    fn test_backward_jump_stays_absolute() {
        // 0: NOP; 1: loop head NOP; 2: JUMP_ABSOLUTE 1
        let (code, _) = assemble_stream(vec![
            instr(Opcode::Nop, 0),
            instr(Opcode::Nop, 0),
            instr(Opcode::JumpAbsolute, 1),
        ]);
        let decoded = decode(&code);
        assert_eq!(decoded[2].0, Opcode::JumpAbsolute);
        // Absolute byte address of unit 1.
        assert_eq!(decoded[2].1, 2);
    }

    #[test]
    fn test_branch_sizes_shrink_to_fixed_point() {
        // The function is long enough that branches start two units wide,
        // but this branch only hops over one NOP: it must shrink to one.
        let mut stream = vec![
            instr(Opcode::LoadFast, 0),
            instr(Opcode::PopJumpIfFalse, 3),
            instr(Opcode::Nop, 0),
        ];
        for _ in 0..130 {
            stream.push(instr(Opcode::Nop, 0));
        }
        stream.push(instr(Opcode::LoadConst, 0));
        stream.push(instr(Opcode::ReturnValue, 0));
        let mut cfg = ControlFlowGraph::from_instructions(stream).unwrap();
        analysis::mark_reachable(&mut cfg);
        let order = emission_order(&mut cfg).unwrap();
        initialize_offsets(&mut cfg, &order);
        assert_eq!(cfg.instructions()[1].size, 2);
        compute_offsets(&mut cfg, &order).unwrap();
        assert_eq!(cfg.instructions()[1].size, 1);
        // Every instruction satisfies size == instrsize(operand).
        offset_sanity_check(&mut cfg, &order).unwrap();
    }

    #[test]
    fn test_far_branch_keeps_extended_arg() {
        // A conditional over ~200 padding instructions: the absolute target
        // lands past byte 255, forcing a two-unit encoding.
        let mut stream = vec![instr(Opcode::LoadFast, 0), instr(Opcode::PopJumpIfFalse, 202)];
        for _ in 0..200 {
            stream.push(instr(Opcode::Nop, 0));
        }
        stream.push(instr(Opcode::LoadConst, 0));
        stream.push(instr(Opcode::ReturnValue, 0));
        let (code, _) = assemble_stream(stream);
        let decoded = decode(&code);
        assert_eq!(decoded[1].0, Opcode::PopJumpIfFalse);
        // Target unit: 1 (LOAD_FAST) + 2 (wide branch) + 200 nops = 203;
        // byte address 406.
        assert_eq!(decoded[1].1, 406);
        assert_eq!(code.len(), (1 + 2 + 200 + 1 + 1) * 2);
    }

    #[test]
    fn test_lnotab_records_line_starts() {
        let mut stream = vec![
            Instruction::new(Opcode::LoadConst, 0, 1),
            Instruction::new(Opcode::LoadConst, 1, 2),
            Instruction::new(Opcode::BinaryAdd, 0, 2),
            Instruction::new(Opcode::ReturnValue, 0, 3),
        ];
        // A synthetic instruction inherits the current line.
        stream.insert(3, Instruction::new(Opcode::Nop, 0, -1));
        let (_, lnotab) = {
            let mut cfg = ControlFlowGraph::from_instructions(stream).unwrap();
            analysis::mark_reachable(&mut cfg);
            assemble(&mut cfg, 1).unwrap()
        };
        // (2 bytes, +1 line) at the second load, (4 bytes, +1) at the
        // return (the NOP emitted nothing).
        assert_eq!(lnotab, vec![2, 1, 6, 1]);
    }

    #[test]
    fn test_lnotab_splits_wide_spans() {
        // 200 single-unit instructions on line 1, then line 1000.
        let mut stream = Vec::new();
        stream.push(Instruction::new(Opcode::LoadConst, 0, 1));
        for _ in 0..199 {
            stream.push(Instruction::new(Opcode::Nop, 0, 1));
        }
        stream.push(Instruction::new(Opcode::ReturnValue, 0, 1000));
        let (_, lnotab) = {
            let mut cfg = ControlFlowGraph::from_instructions(stream).unwrap();
            analysis::mark_reachable(&mut cfg);
            assemble(&mut cfg, 1).unwrap()
        };
        // 400 bytes of line-1 code: (255, 0) then (145, ...). 999 lines of
        // delta: 7 * 127 = 889, remainder 110.
        assert_eq!(&lnotab[..4], &[255, 0, 145, 127]);
        let rest = &lnotab[4..];
        assert_eq!(rest.len(), 7 * 2);
        for pair in rest[..12].chunks(2) {
            assert_eq!(pair, &[0, 127]);
        }
        assert_eq!(&rest[12..], &[0, 110]);
    }

    #[test]
    fn test_empty_block_is_transparent_to_targets() {
        // The conditional targets an empty block; its offset equals the
        // following block's, so the branch lands on the first real
        // instruction.
        let mut cfg = ControlFlowGraph::from_instructions(vec![
            instr(Opcode::LoadFast, 0),
            instr(Opcode::PopJumpIfFalse, 2),
            instr(Opcode::Nop, 0),
            instr(Opcode::LoadConst, 0),
            instr(Opcode::ReturnValue, 0),
        ])
        .unwrap();
        cfg.remove_instructions(2, 1);
        assert!(cfg.blocks()[1].is_empty());
        analysis::mark_reachable(&mut cfg);
        let (code, _) = assemble(&mut cfg, 1).unwrap();
        let decoded = decode(&code);
        // Target byte address: unit 2 * 2 = 4, the LOAD_CONST.
        assert_eq!(decoded[1].1, 4);
        assert_eq!(decoded[2].0, Opcode::LoadConst);
    }
}
