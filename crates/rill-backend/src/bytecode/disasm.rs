//! Bytecode disassembler
//!
//! Converts an assembled code object back to a human-readable listing.
//! `EXTENDED_ARG` prefixes are folded into the instruction they widen; the
//! listing shows the byte offset of the first prefix unit, which is what
//! jump operands point at.

use std::fmt::Write;

use super::{CodeObject, Opcode, CODE_UNIT_BYTES};
use crate::value::Value;

/// Disassemble a code object to human-readable form
///
/// # Format
/// ```text
/// === Constants ===
/// 0: 42
/// 1: "hello"
///
/// === Code ===
///    0  LOAD_CONST           0 (42)        ; line 1
///    2  RETURN_VALUE         0             ; line 1
/// ```
pub fn disassemble(code: &CodeObject, consts: &[Value]) -> String {
    let mut output = String::new();

    if !consts.is_empty() {
        let _ = writeln!(output, "=== Constants ===");
        for (index, value) in consts.iter().enumerate() {
            let _ = writeln!(output, "{index}: {value}");
        }
        let _ = writeln!(output);
    }

    let _ = writeln!(output, "=== Code ===");
    let mut ext: u32 = 0;
    let mut start: Option<usize> = None;
    for (unit, pair) in code.code.chunks(CODE_UNIT_BYTES as usize).enumerate() {
        let byte_offset = unit * CODE_UNIT_BYTES as usize;
        let opcode = match Opcode::try_from(pair[0]) {
            Ok(op) => op,
            Err(byte) => {
                let _ = writeln!(output, "{byte_offset:>4}  <invalid opcode {byte:#04x}>");
                ext = 0;
                start = None;
                continue;
            }
        };
        if opcode == Opcode::ExtendedArg {
            ext = (ext << 8) | pair[1] as u32;
            start.get_or_insert(byte_offset);
            continue;
        }
        let oparg = (ext << 8) | pair[1] as u32;
        let shown_offset = start.take().unwrap_or(byte_offset);
        ext = 0;
        let line = code.line_for_offset(shown_offset);
        let mut text = format!("{shown_offset:>4}  {:<20} {oparg}", opcode.name());
        if opcode == Opcode::LoadConst {
            if let Some(value) = consts.get(oparg as usize) {
                let _ = write!(text, " ({value})");
            }
        }
        let _ = writeln!(output, "{text:<40} ; line {line}");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_shows_constants_and_lines() {
        let code = CodeObject {
            code: vec![
                Opcode::LoadConst as u8,
                1,
                Opcode::ReturnValue as u8,
                0,
            ],
            lnotab: vec![2, 3],
            max_stack_depth: 1,
            first_lineno: 7,
        };
        let consts = vec![Value::Int(0), Value::string("hi")];
        let listing = disassemble(&code, &consts);
        assert!(listing.contains("=== Constants ==="));
        assert!(listing.contains("1: \"hi\""));
        assert!(listing.contains("LOAD_CONST           1 (\"hi\")"));
        assert!(listing.contains("; line 7"));
        assert!(listing.contains("RETURN_VALUE"));
        assert!(listing.contains("; line 10"));
    }

    #[test]
    fn test_extended_arg_is_folded() {
        let code = CodeObject {
            code: vec![
                Opcode::ExtendedArg as u8,
                0x01,
                Opcode::LoadConst as u8,
                0x02,
                Opcode::ReturnValue as u8,
                0,
            ],
            lnotab: vec![],
            max_stack_depth: 1,
            first_lineno: 1,
        };
        let listing = disassemble(&code, &[]);
        assert!(listing.contains("LOAD_CONST           258"));
        // Shown at the prefix's offset, where a jump would land.
        assert!(listing.contains("   0  LOAD_CONST"));
        assert!(listing.contains("   4  RETURN_VALUE"));
        assert!(!listing.contains("EXTENDED_ARG"));
    }
}
