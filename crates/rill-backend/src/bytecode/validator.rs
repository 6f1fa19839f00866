//! Bytecode validator — static checks over the assembled stream
//!
//! Performs four checks:
//! 1. **Decode pass** — even length, every unit a known opcode, no dangling
//!    or over-long `EXTENDED_ARG` chain
//! 2. **Jump targets** — every branch lands inside the stream, on a
//!    code-unit boundary that starts an instruction
//! 3. **Constant refs** — every `LOAD_CONST` index is within the pool
//! 4. **Termination** — the stream ends in a terminator
//!
//! The validator is advisory: the assembler already enforces these by
//! construction, and the test suite runs it over every artefact to prove
//! that.

use std::collections::HashSet;

use super::{CodeObject, Opcode, CODE_UNIT_BYTES};
use crate::value::Value;

/// A validation error with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Byte offset in the instruction stream where the error was detected.
    pub offset: usize,
    /// What went wrong.
    pub kind: ValidationErrorKind,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {:#06x}: {}", self.offset, self.kind)
    }
}

/// Kinds of errors the validator can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The stream is not a whole number of code units.
    OddLength { len: usize },
    /// A unit whose opcode byte is not a recognised opcode.
    UnknownOpcode(u8),
    /// The stream ends inside an `EXTENDED_ARG` chain.
    DanglingExtendedArg,
    /// More than three `EXTENDED_ARG` prefixes in a row.
    ExtendedArgChainTooLong { length: usize },
    /// A jump target falls outside `[0, code.len())`.
    JumpOutOfBounds { target: usize, len: usize },
    /// A jump target does not begin an instruction.
    JumpMisaligned { target: usize },
    /// A `LOAD_CONST` index exceeds the pool size.
    ConstantIndexOutOfBounds { index: usize, pool_size: usize },
    /// The last instruction is not a terminator.
    MissingTerminator,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OddLength { len } => {
                write!(f, "stream length {len} is not a multiple of the code-unit size")
            }
            Self::UnknownOpcode(byte) => write!(f, "unknown opcode {byte:#04x}"),
            Self::DanglingExtendedArg => {
                write!(f, "stream ends inside an EXTENDED_ARG chain")
            }
            Self::ExtendedArgChainTooLong { length } => {
                write!(f, "{length} EXTENDED_ARG prefixes in a row (max 3)")
            }
            Self::JumpOutOfBounds { target, len } => {
                write!(f, "jump target {target} is out of bounds (len={len})")
            }
            Self::JumpMisaligned { target } => {
                write!(f, "jump target {target} does not begin an instruction")
            }
            Self::ConstantIndexOutOfBounds { index, pool_size } => {
                write!(f, "constant index {index} out of bounds (pool size={pool_size})")
            }
            Self::MissingTerminator => {
                write!(f, "bytecode does not end in a terminator")
            }
        }
    }
}

/// Validate `code`, collecting all errors found.
///
/// Returns `Ok(())` if no issues are found, otherwise `Err(errors)` with
/// every detected problem. Does NOT short-circuit on the first error.
pub fn validate(code: &CodeObject, consts: &[Value]) -> Result<(), Vec<ValidationError>> {
    let mut errors: Vec<ValidationError> = Vec::new();

    if code.code.len() % CODE_UNIT_BYTES as usize != 0 {
        errors.push(ValidationError {
            offset: code.code.len(),
            kind: ValidationErrorKind::OddLength {
                len: code.code.len(),
            },
        });
        return Err(errors);
    }

    let decoded = decode_instructions(code, &mut errors);
    let starts: HashSet<usize> = decoded.iter().map(|d| d.offset).collect();
    check_jump_targets(code, &decoded, &starts, &mut errors);
    check_constant_refs(consts, &decoded, &mut errors);
    check_terminator(&decoded, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// A decoded instruction: byte offset of its first unit (prefixes
/// included), resolved opcode and operand.
#[derive(Debug, Clone)]
struct DecodedInstruction {
    offset: usize,
    opcode: Opcode,
    oparg: u32,
}

fn decode_instructions(
    code: &CodeObject,
    errors: &mut Vec<ValidationError>,
) -> Vec<DecodedInstruction> {
    let mut decoded = Vec::new();
    let mut ext: u32 = 0;
    let mut chain = 0usize;
    let mut start: Option<usize> = None;

    for (unit, pair) in code.code.chunks(CODE_UNIT_BYTES as usize).enumerate() {
        let byte_offset = unit * CODE_UNIT_BYTES as usize;
        let opcode = match Opcode::try_from(pair[0]) {
            Ok(op) => op,
            Err(byte) => {
                errors.push(ValidationError {
                    offset: byte_offset,
                    kind: ValidationErrorKind::UnknownOpcode(byte),
                });
                ext = 0;
                chain = 0;
                start = None;
                continue;
            }
        };
        if opcode == Opcode::ExtendedArg {
            ext = (ext << 8) | pair[1] as u32;
            chain += 1;
            start.get_or_insert(byte_offset);
            continue;
        }
        if chain > 3 {
            errors.push(ValidationError {
                offset: start.unwrap_or(byte_offset),
                kind: ValidationErrorKind::ExtendedArgChainTooLong { length: chain },
            });
        }
        decoded.push(DecodedInstruction {
            offset: start.take().unwrap_or(byte_offset),
            opcode,
            oparg: (ext << 8) | pair[1] as u32,
        });
        ext = 0;
        chain = 0;
    }
    if start.is_some() {
        errors.push(ValidationError {
            offset: code.code.len(),
            kind: ValidationErrorKind::DanglingExtendedArg,
        });
    }
    decoded
}

fn check_jump_targets(
    code: &CodeObject,
    decoded: &[DecodedInstruction],
    starts: &HashSet<usize>,
    errors: &mut Vec<ValidationError>,
) {
    let len = code.code.len();
    for (index, instr) in decoded.iter().enumerate() {
        if !instr.opcode.is_branch() {
            continue;
        }
        let target = if instr.opcode.uses_relative_offset() {
            // Relative to the end of this instruction; the next decoded
            // instruction starts there.
            let after = decoded
                .get(index + 1)
                .map(|next| next.offset)
                .unwrap_or(len);
            after + instr.oparg as usize
        } else {
            instr.oparg as usize
        };
        if target >= len {
            errors.push(ValidationError {
                offset: instr.offset,
                kind: ValidationErrorKind::JumpOutOfBounds { target, len },
            });
            continue;
        }
        if !starts.contains(&target) {
            errors.push(ValidationError {
                offset: instr.offset,
                kind: ValidationErrorKind::JumpMisaligned { target },
            });
        }
    }
}

fn check_constant_refs(
    consts: &[Value],
    decoded: &[DecodedInstruction],
    errors: &mut Vec<ValidationError>,
) {
    for instr in decoded {
        if instr.opcode != Opcode::LoadConst {
            continue;
        }
        let index = instr.oparg as usize;
        if index >= consts.len() {
            errors.push(ValidationError {
                offset: instr.offset,
                kind: ValidationErrorKind::ConstantIndexOutOfBounds {
                    index,
                    pool_size: consts.len(),
                },
            });
        }
    }
}

fn check_terminator(decoded: &[DecodedInstruction], errors: &mut Vec<ValidationError>) {
    match decoded.last() {
        None => errors.push(ValidationError {
            offset: 0,
            kind: ValidationErrorKind::MissingTerminator,
        }),
        Some(instr) => {
            if !instr.opcode.is_terminator() {
                errors.push(ValidationError {
                    offset: instr.offset,
                    kind: ValidationErrorKind::MissingTerminator,
                });
            }
        }
    }
}
