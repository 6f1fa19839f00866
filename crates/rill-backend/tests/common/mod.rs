//! Shared helpers for the back-end integration suites: stream builders, a
//! wordcode decoder, and a small stack interpreter used to compare the
//! behaviour of optimized and unoptimized output.

#![allow(dead_code)]

use rill_backend::{CodeObject, Instruction, Opcode, Value, CODE_UNIT_BYTES};

pub fn instr(opcode: Opcode, oparg: u32) -> Instruction {
    Instruction::new(opcode, oparg, 1)
}

pub fn line_instr(opcode: Opcode, oparg: u32, line: i32) -> Instruction {
    Instruction::new(opcode, oparg, line)
}

/// `(byte_offset, opcode, resolved_arg)` triples with EXTENDED_ARG folded
/// into the instruction it widens.
pub fn decode(code: &[u8]) -> Vec<(usize, Opcode, u32)> {
    let mut out = Vec::new();
    let mut ext: u32 = 0;
    let mut start: Option<usize> = None;
    for (unit, pair) in code.chunks(CODE_UNIT_BYTES as usize).enumerate() {
        let byte_offset = unit * CODE_UNIT_BYTES as usize;
        let opcode = Opcode::try_from(pair[0]).expect("emitted an unknown opcode");
        if opcode == Opcode::ExtendedArg {
            ext = (ext << 8) | pair[1] as u32;
            start.get_or_insert(byte_offset);
            continue;
        }
        out.push((
            start.take().unwrap_or(byte_offset),
            opcode,
            (ext << 8) | pair[1] as u32,
        ));
        ext = 0;
    }
    out
}

/// Opcodes only, for shape assertions.
pub fn opcodes(code: &[u8]) -> Vec<Opcode> {
    decode(code).into_iter().map(|(_, op, _)| op).collect()
}

/// Count raw EXTENDED_ARG units in the stream.
pub fn extended_arg_count(code: &[u8]) -> usize {
    code.chunks(CODE_UNIT_BYTES as usize)
        .filter(|pair| pair[0] == Opcode::ExtendedArg as u8)
        .count()
}

/// What one execution produced: the returned value and the final locals.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub returned: Value,
    pub locals: Vec<Value>,
}

/// Execute assembled wordcode over the opcode subset the test programs
/// use. Panics on anything else; this is a test oracle, not a VM.
pub fn execute(code: &CodeObject, consts: &[Value], mut locals: Vec<Value>) -> ExecOutcome {
    let units: Vec<(u8, u8)> = code
        .code
        .chunks(CODE_UNIT_BYTES as usize)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0usize;
    let mut ext: u32 = 0;
    let mut steps = 0usize;
    loop {
        steps += 1;
        assert!(steps < 100_000, "test program ran away");
        let (byte, low) = units[pc];
        let opcode = Opcode::try_from(byte).expect("unknown opcode in emitted code");
        let oparg = (ext << 8) | low as u32;
        ext = 0;
        pc += 1;
        match opcode {
            Opcode::ExtendedArg => ext = oparg,
            Opcode::Nop => {}
            Opcode::PopTop => {
                stack.pop().expect("pop from empty stack");
            }
            Opcode::DupTop => {
                let top = stack.last().expect("dup from empty stack").clone();
                stack.push(top);
            }
            Opcode::DupTopTwo => {
                let len = stack.len();
                stack.push(stack[len - 2].clone());
                stack.push(stack[len - 1].clone());
            }
            Opcode::RotTwo => {
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let top = stack.pop().expect("rot on short stack");
                let len = stack.len();
                stack.insert(len - 2, top);
            }
            Opcode::UnaryNot => {
                let value = stack.pop().expect("not on empty stack");
                stack.push(Value::Bool(!value.truthiness().expect("foreign in test")));
            }
            Opcode::BinaryAdd => {
                let rhs = stack.pop().expect("add on short stack");
                let lhs = stack.pop().expect("add on short stack");
                match (lhs, rhs) {
                    (Value::Int(a), Value::Int(b)) => stack.push(Value::Int(a + b)),
                    other => panic!("test add over {other:?}"),
                }
            }
            Opcode::LoadConst => stack.push(consts[oparg as usize].clone()),
            Opcode::LoadFast => stack.push(locals[oparg as usize].clone()),
            Opcode::StoreFast => {
                let value = stack.pop().expect("store from empty stack");
                locals[oparg as usize] = value;
            }
            Opcode::BuildTuple | Opcode::BuildList => {
                let n = oparg as usize;
                let items = stack.split_off(stack.len() - n);
                stack.push(Value::tuple(items));
            }
            Opcode::UnpackSequence => {
                let Value::Tuple(items) = stack.pop().expect("unpack from empty stack") else {
                    panic!("unpack of a non-tuple");
                };
                assert_eq!(items.len(), oparg as usize);
                for item in items.iter().rev() {
                    stack.push(item.clone());
                }
            }
            Opcode::JumpAbsolute => pc = (oparg / CODE_UNIT_BYTES) as usize,
            Opcode::JumpForward => pc += (oparg / CODE_UNIT_BYTES) as usize,
            Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => {
                let value = stack.pop().expect("branch on empty stack");
                let truthy = value.truthiness().expect("foreign in test");
                if truthy == (opcode == Opcode::PopJumpIfTrue) {
                    pc = (oparg / CODE_UNIT_BYTES) as usize;
                }
            }
            Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                let truthy = stack
                    .last()
                    .expect("branch on empty stack")
                    .truthiness()
                    .expect("foreign in test");
                if truthy == (opcode == Opcode::JumpIfTrueOrPop) {
                    pc = (oparg / CODE_UNIT_BYTES) as usize;
                } else {
                    stack.pop();
                }
            }
            Opcode::ReturnValue => {
                let returned = stack.pop().expect("return from empty stack");
                return ExecOutcome { returned, locals };
            }
            other => panic!("test interpreter does not model {other}"),
        }
    }
}
