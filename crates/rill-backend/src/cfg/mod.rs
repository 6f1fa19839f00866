//! Control-flow graph over a linear instruction stream
//!
//! The builder partitions the caller's instructions into basic blocks,
//! rewrites branch operands from instruction indices to block indices, and
//! computes fallthrough links. Every cross-reference in the graph is an
//! index, never a pointer, so the backing `Vec`s may reallocate freely while
//! the optimizer grows the block array.
//!
//! Structural invariants (checked by [`ControlFlowGraph::sanity_check`]):
//! - a block either ends in a terminator and has no fallthrough, or does not
//!   and has one;
//! - each block is the fallthrough of at most one other block;
//! - an empty block always has a fallthrough;
//! - every branch operand is a valid block index.

pub mod analysis;
mod dump;

use crate::bytecode::Opcode;
use crate::error::BackendError;

/// Instruction flag: transfers control to an explicit target.
pub const IS_BRANCH: u8 = 1 << 0;
/// Instruction flag: unconditionally leaves the block.
pub const IS_TERMINATOR: u8 = 1 << 1;
/// Instruction flag: last entry of a front-end jump chain. Set by the
/// producer while resolving forward references; the back-end preserves it.
pub const END_OF_JUMP_LIST: u8 = 1 << 2;

fn flags_for(opcode: Opcode) -> u8 {
    let mut flags = 0;
    if opcode.is_branch() {
        flags |= IS_BRANCH;
    }
    if opcode.is_terminator() {
        flags |= IS_TERMINATOR;
    }
    flags
}

/// One instruction of the input stream.
///
/// For branches, `oparg` holds the absolute index of the target instruction
/// on entry to the builder and the target *block* index afterwards. `size`
/// is assembler scratch: the encoded width in code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub oparg: u32,
    pub flags: u8,
    /// Source line, -1 for synthetic instructions.
    pub line: i32,
    /// Encoded width in code units; set by the assembler.
    pub size: u8,
}

impl Instruction {
    /// Build an instruction with flags derived from the opcode.
    pub fn new(opcode: Opcode, oparg: u32, line: i32) -> Self {
        Self {
            opcode,
            oparg,
            flags: flags_for(opcode),
            line,
            size: 0,
        }
    }

    pub fn is_branch(&self) -> bool {
        self.flags & IS_BRANCH != 0
    }

    pub fn is_terminator(&self) -> bool {
        self.flags & IS_TERMINATOR != 0
    }

    /// Rewrite the opcode, re-deriving the branch/terminator flags and
    /// preserving the producer's jump-list marker.
    pub(crate) fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
        self.flags = flags_for(opcode) | (self.flags & END_OF_JUMP_LIST);
    }
}

/// A basic block: a half-open range of instructions with a single entry and
/// a single exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    /// Index of the first instruction.
    pub start: usize,
    /// Index one past the last instruction.
    pub end: usize,
    /// Block entered when control walks off the end; `None` iff the block
    /// ends in a terminator.
    pub fallthrough: Option<usize>,
    pub is_reachable: bool,
    pub is_exit: bool,
    /// Single-bit worklist marker, shared by every pass that needs one.
    pub grey: bool,
    /// Operand-stack depth on entry; `None` until the analyzer visits.
    pub entry_depth: Option<i32>,
    /// Assembler scratch: offset of the block in code units.
    pub offset: u32,
    /// Assembler scratch: encoded width of the block in code units.
    pub size: u32,
}

impl BasicBlock {
    fn starting_at(start: usize) -> Self {
        Self {
            start,
            end: start,
            fallthrough: None,
            is_reachable: true,
            is_exit: false,
            grey: false,
            entry_depth: None,
            offset: 0,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The graph. Owns the instruction array and the block array.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) blocks: Vec<BasicBlock>,
}

/// Check a graph invariant; on failure, dump the CFG and abort in debug
/// builds, or return an `InvariantViolation` in release builds.
macro_rules! cfg_ensure {
    ($cfg:expr, $cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($cfg.invariant_failure(format!($($arg)+)));
        }
    };
}
pub(crate) use cfg_ensure;

impl ControlFlowGraph {
    /// Partition `instructions` into basic blocks.
    ///
    /// Branch instructions must carry the absolute instruction index of
    /// their target; the builder rewrites them to block indices. The stream
    /// must be non-empty and end in a terminator.
    pub fn from_instructions(instructions: Vec<Instruction>) -> Result<Self, BackendError> {
        let n = instructions.len();
        let mut cfg = ControlFlowGraph {
            instructions,
            blocks: Vec::with_capacity(16),
        };
        cfg_ensure!(cfg, n > 0, "instruction stream is empty");
        for i in 0..n {
            let inst = &cfg.instructions[i];
            cfg_ensure!(
                cfg,
                inst.flags & IS_BRANCH != 0 || !inst.opcode.is_branch(),
                "branch opcode {} at {i} is missing its IS_BRANCH flag",
                inst.opcode
            );
            if inst.is_branch() {
                cfg_ensure!(
                    cfg,
                    (inst.oparg as usize) < n,
                    "branch at {i} targets instruction {} of {n}",
                    inst.oparg
                );
            }
        }

        // Mark block leaders: the entry, every branch target, and every
        // instruction after a branch or terminator.
        let mut leader = vec![false; n];
        leader[0] = true;
        for i in 0..n {
            let inst = &cfg.instructions[i];
            if inst.is_branch() {
                leader[inst.oparg as usize] = true;
                if i + 1 < n {
                    leader[i + 1] = true;
                }
            } else if inst.is_terminator() && i + 1 < n {
                leader[i + 1] = true;
            }
        }

        // Create a block per leader and remember which block each
        // instruction landed in.
        let mut block_at = vec![0usize; n];
        for i in 0..n {
            if leader[i] {
                if let Some(prev) = cfg.blocks.last_mut() {
                    prev.end = i;
                }
                cfg.blocks.push(BasicBlock::starting_at(i));
            }
            block_at[i] = cfg.blocks.len() - 1;
        }
        if let Some(last) = cfg.blocks.last_mut() {
            last.end = n;
        }

        // Branch operands: instruction index -> block index.
        for inst in &mut cfg.instructions {
            if inst.flags & IS_BRANCH != 0 {
                inst.oparg = block_at[inst.oparg as usize] as u32;
            }
        }

        // Fallthrough links and exit flags.
        let count = cfg.blocks.len();
        for b in 0..count {
            let blk = &cfg.blocks[b];
            let terminated = !blk.is_empty() && cfg.instructions[blk.end - 1].is_terminator();
            if terminated {
                cfg.blocks[b].fallthrough = None;
                cfg.blocks[b].is_exit = true;
            } else {
                cfg_ensure!(
                    cfg,
                    b + 1 < count,
                    "block {b} runs off the end of the stream without a terminator"
                );
                cfg.blocks[b].fallthrough = Some(b + 1);
            }
        }
        Ok(cfg)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Instructions of one block.
    pub fn block_slice(&self, b: usize) -> &[Instruction] {
        &self.instructions[self.blocks[b].start..self.blocks[b].end]
    }

    /// Shallow-copy a block onto the end of the block array, sharing the
    /// instruction range. Only blocks without a fallthrough may be copied;
    /// a copied fallthrough link would give its target two predecessors.
    pub(crate) fn copy_block(&mut self, b: usize) -> usize {
        debug_assert!(self.blocks[b].fallthrough.is_none());
        let copy = self.blocks[b];
        self.blocks.push(copy);
        self.blocks.len() - 1
    }

    /// Delete `count` instructions starting at absolute index `at`,
    /// compacting the array and shifting every block range behind the
    /// deletion point. Branch operands are block indices and need no
    /// touch-up.
    pub(crate) fn remove_instructions(&mut self, at: usize, count: usize) {
        if count == 0 {
            return;
        }
        debug_assert!(at + count <= self.instructions.len());
        self.instructions.drain(at..at + count);
        for blk in &mut self.blocks {
            if blk.start > at {
                blk.start -= count;
            }
            if blk.end > at {
                blk.end -= count;
            }
        }
    }

    /// Follow fallthrough links until a non-empty block is found. Empty
    /// blocks are transparent to branch-target resolution.
    pub(crate) fn resolve_nonempty(&self, start: usize) -> Result<usize, BackendError> {
        let mut b = start;
        let mut steps = 0;
        while self.blocks[b].is_empty() {
            cfg_ensure!(
                self,
                steps <= self.blocks.len(),
                "fallthrough cycle through empty blocks at block {start}"
            );
            match self.blocks[b].fallthrough {
                Some(f) => b = f,
                None => {
                    return Err(
                        self.invariant_failure(format!("empty block {b} has no fallthrough"))
                    )
                }
            }
            steps += 1;
        }
        Ok(b)
    }

    /// Verify every structural invariant of the graph. Uses the `grey` bit
    /// to check fallthrough-target uniqueness.
    pub fn sanity_check(&mut self) -> Result<(), BackendError> {
        for blk in &mut self.blocks {
            blk.grey = false;
        }
        for b in 0..self.blocks.len() {
            let blk = self.blocks[b];
            cfg_ensure!(self, blk.end >= blk.start, "block {b} has a negative range");
            cfg_ensure!(
                self,
                blk.end <= self.instructions.len(),
                "block {b} extends past the instruction array"
            );
            match blk.fallthrough {
                Some(f) => {
                    cfg_ensure!(self, f < self.blocks.len(), "block {b} falls through to missing block {f}");
                    cfg_ensure!(
                        self,
                        blk.is_empty() || !self.instructions[blk.end - 1].is_terminator(),
                        "block {b} has both a terminator and a fallthrough"
                    );
                    cfg_ensure!(self, !blk.is_exit, "exit block {b} has a fallthrough");
                    cfg_ensure!(
                        self,
                        !self.blocks[f].grey,
                        "block {f} is the fallthrough of two blocks"
                    );
                    self.blocks[f].grey = true;
                }
                None => {
                    cfg_ensure!(self, !blk.is_empty(), "empty block {b} has no fallthrough");
                    cfg_ensure!(self, blk.is_exit, "block {b} has no fallthrough but is not an exit");
                    cfg_ensure!(
                        self,
                        self.instructions[blk.end - 1].is_terminator(),
                        "exit block {b} does not end in a terminator"
                    );
                }
            }
            for i in blk.start..blk.end {
                let inst = &self.instructions[i];
                if inst.is_branch() {
                    cfg_ensure!(
                        self,
                        (inst.oparg as usize) < self.blocks.len(),
                        "branch at {i} targets missing block {}",
                        inst.oparg
                    );
                    cfg_ensure!(
                        self,
                        i == blk.end - 1,
                        "branch at {i} is not the last instruction of block {b}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Report a violated invariant: fatal with a CFG dump in debug builds,
    /// an ordinary error (no dump) in release builds.
    pub(crate) fn invariant_failure(&self, detail: String) -> BackendError {
        if cfg!(debug_assertions) {
            eprintln!("{}", self.dump_string());
            panic!("cfg invariant violated: {detail}");
        }
        BackendError::InvariantViolation { detail }
    }
}
