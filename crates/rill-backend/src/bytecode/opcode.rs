//! The closed opcode set understood by the back-end
//!
//! Every opcode carries three static profiles consulted by the analyzer and
//! the assembler:
//! - branch/terminator classification (which edges it creates),
//! - a `(jump-taken, not-taken)` stack-effect pair,
//! - a minimum required operand-stack depth.
//!
//! The set is the subset of the runtime's ISA that reaches the back-end; an
//! opcode outside it cannot be constructed.

use serde::{Deserialize, Serialize};

/// Size in bytes of one code unit: `(opcode, arg_byte)`.
pub const CODE_UNIT_BYTES: u32 = 2;

/// Bytecode opcode.
///
/// Discriminants are the wire encoding; `TryFrom<u8>` is the inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    ExtendedArg = 1,

    // Stack manipulation
    PopTop = 2,
    RotTwo = 3,
    RotThree = 4,
    RotFour = 5,
    DupTop = 6,
    DupTopTwo = 7,

    // Unary operators
    UnaryPositive = 8,
    UnaryNegative = 9,
    UnaryNot = 10,
    UnaryInvert = 11,
    GetIter = 12,

    // Binary operators
    BinaryPower = 13,
    BinaryMultiply = 14,
    BinaryModulo = 15,
    BinaryAdd = 16,
    BinarySubtract = 17,
    BinarySubscr = 18,
    BinaryFloorDivide = 19,
    BinaryTrueDivide = 20,
    BinaryLshift = 21,
    BinaryRshift = 22,
    BinaryAnd = 23,
    BinaryXor = 24,
    BinaryOr = 25,

    // In-place operators
    InplacePower = 26,
    InplaceMultiply = 27,
    InplaceModulo = 28,
    InplaceAdd = 29,
    InplaceSubtract = 30,
    InplaceFloorDivide = 31,
    InplaceTrueDivide = 32,
    InplaceLshift = 33,
    InplaceRshift = 34,
    InplaceAnd = 35,
    InplaceXor = 36,
    InplaceOr = 37,

    StoreSubscr = 38,
    DeleteSubscr = 39,
    CompareOp = 40,

    // Block exits
    ReturnValue = 41,
    YieldValue = 42,
    RaiseVarargs = 43,
    Reraise = 44,
    PopBlock = 45,
    PopExcept = 46,

    // Loads and stores
    LoadConst = 47,
    LoadFast = 48,
    StoreFast = 49,
    DeleteFast = 50,
    LoadName = 51,
    StoreName = 52,
    DeleteName = 53,
    LoadGlobal = 54,
    StoreGlobal = 55,
    DeleteGlobal = 56,
    LoadAttr = 57,
    StoreAttr = 58,
    DeleteAttr = 59,
    LoadMethod = 60,

    // Builders
    BuildTuple = 61,
    BuildList = 62,
    BuildSet = 63,
    BuildMap = 64,
    BuildString = 65,
    BuildSlice = 66,
    UnpackSequence = 67,
    UnpackEx = 68,
    ListAppend = 69,
    SetAdd = 70,
    MapAdd = 71,

    // Calls
    CallFunction = 72,
    CallFunctionKw = 73,
    CallMethod = 74,
    MakeFunction = 75,

    // Jump family
    JumpForward = 76,
    JumpAbsolute = 77,
    PopJumpIfFalse = 78,
    PopJumpIfTrue = 79,
    JumpIfFalseOrPop = 80,
    JumpIfTrueOrPop = 81,
    ForIter = 82,
    SetupFinally = 83,
    SetupWith = 84,
}

/// Wire-order table; `OPCODE_TABLE[op as usize] == op` for every opcode.
const OPCODE_TABLE: [Opcode; 85] = [
    Opcode::Nop,
    Opcode::ExtendedArg,
    Opcode::PopTop,
    Opcode::RotTwo,
    Opcode::RotThree,
    Opcode::RotFour,
    Opcode::DupTop,
    Opcode::DupTopTwo,
    Opcode::UnaryPositive,
    Opcode::UnaryNegative,
    Opcode::UnaryNot,
    Opcode::UnaryInvert,
    Opcode::GetIter,
    Opcode::BinaryPower,
    Opcode::BinaryMultiply,
    Opcode::BinaryModulo,
    Opcode::BinaryAdd,
    Opcode::BinarySubtract,
    Opcode::BinarySubscr,
    Opcode::BinaryFloorDivide,
    Opcode::BinaryTrueDivide,
    Opcode::BinaryLshift,
    Opcode::BinaryRshift,
    Opcode::BinaryAnd,
    Opcode::BinaryXor,
    Opcode::BinaryOr,
    Opcode::InplacePower,
    Opcode::InplaceMultiply,
    Opcode::InplaceModulo,
    Opcode::InplaceAdd,
    Opcode::InplaceSubtract,
    Opcode::InplaceFloorDivide,
    Opcode::InplaceTrueDivide,
    Opcode::InplaceLshift,
    Opcode::InplaceRshift,
    Opcode::InplaceAnd,
    Opcode::InplaceXor,
    Opcode::InplaceOr,
    Opcode::StoreSubscr,
    Opcode::DeleteSubscr,
    Opcode::CompareOp,
    Opcode::ReturnValue,
    Opcode::YieldValue,
    Opcode::RaiseVarargs,
    Opcode::Reraise,
    Opcode::PopBlock,
    Opcode::PopExcept,
    Opcode::LoadConst,
    Opcode::LoadFast,
    Opcode::StoreFast,
    Opcode::DeleteFast,
    Opcode::LoadName,
    Opcode::StoreName,
    Opcode::DeleteName,
    Opcode::LoadGlobal,
    Opcode::StoreGlobal,
    Opcode::DeleteGlobal,
    Opcode::LoadAttr,
    Opcode::StoreAttr,
    Opcode::DeleteAttr,
    Opcode::LoadMethod,
    Opcode::BuildTuple,
    Opcode::BuildList,
    Opcode::BuildSet,
    Opcode::BuildMap,
    Opcode::BuildString,
    Opcode::BuildSlice,
    Opcode::UnpackSequence,
    Opcode::UnpackEx,
    Opcode::ListAppend,
    Opcode::SetAdd,
    Opcode::MapAdd,
    Opcode::CallFunction,
    Opcode::CallFunctionKw,
    Opcode::CallMethod,
    Opcode::MakeFunction,
    Opcode::JumpForward,
    Opcode::JumpAbsolute,
    Opcode::PopJumpIfFalse,
    Opcode::PopJumpIfTrue,
    Opcode::JumpIfFalseOrPop,
    Opcode::JumpIfTrueOrPop,
    Opcode::ForIter,
    Opcode::SetupFinally,
    Opcode::SetupWith,
];

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OPCODE_TABLE
            .get(value as usize)
            .copied()
            .ok_or(value)
    }
}

impl Opcode {
    /// True for every opcode that transfers control to an explicit target.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpAbsolute
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::SetupWith
        )
    }

    /// True for opcodes that unconditionally leave the block. An
    /// unconditional jump is both a branch and a terminator.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::Reraise
                | Opcode::JumpForward
                | Opcode::JumpAbsolute
        )
    }

    /// True for the two unconditional jumps.
    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Opcode::JumpForward | Opcode::JumpAbsolute)
    }

    /// True for the four conditional jumps.
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
        )
    }

    /// Branches that encode `(target - end_of_branch) * 2`; the rest of the
    /// jump family encodes `target * 2`.
    pub fn uses_relative_offset(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward | Opcode::ForIter | Opcode::SetupFinally | Opcode::SetupWith
        )
    }

    /// Minimum operand-stack depth this opcode requires on entry.
    pub fn stack_input(self, oparg: u32) -> i32 {
        let oparg = oparg as i32;
        match self {
            Opcode::Nop | Opcode::ExtendedArg => 0,

            Opcode::PopTop => 1,
            Opcode::RotTwo => 2,
            Opcode::RotThree => 3,
            Opcode::RotFour => 4,
            Opcode::DupTop => 1,
            Opcode::DupTopTwo => 2,

            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert
            | Opcode::GetIter => 1,

            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplacePower
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr
            | Opcode::CompareOp => 2,

            Opcode::StoreSubscr => 3,
            Opcode::DeleteSubscr => 2,

            Opcode::ReturnValue | Opcode::YieldValue => 1,
            Opcode::RaiseVarargs => oparg,
            Opcode::Reraise => 3,
            Opcode::PopBlock => 0,
            Opcode::PopExcept => 3,

            Opcode::LoadConst
            | Opcode::LoadFast
            | Opcode::LoadName
            | Opcode::LoadGlobal => 0,
            Opcode::StoreFast | Opcode::StoreName | Opcode::StoreGlobal => 1,
            Opcode::DeleteFast | Opcode::DeleteName | Opcode::DeleteGlobal => 0,
            Opcode::LoadAttr | Opcode::LoadMethod | Opcode::DeleteAttr => 1,
            Opcode::StoreAttr => 2,

            Opcode::BuildTuple
            | Opcode::BuildList
            | Opcode::BuildSet
            | Opcode::BuildString => oparg,
            Opcode::BuildMap => 2 * oparg,
            Opcode::BuildSlice => {
                if oparg == 3 {
                    3
                } else {
                    2
                }
            }
            Opcode::UnpackSequence | Opcode::UnpackEx => 1,
            // LIST_APPEND and SET_ADD pop one value with the container
            // `oparg` slots down; MAP_ADD pops a key and value above it.
            Opcode::ListAppend | Opcode::SetAdd => oparg,
            Opcode::MapAdd => oparg + 2,

            Opcode::CallFunction => oparg + 1,
            Opcode::CallFunctionKw => oparg + 2,
            Opcode::CallMethod => oparg + 2,
            Opcode::MakeFunction => 2 + (oparg & 0x0f).count_ones() as i32,

            Opcode::JumpForward | Opcode::JumpAbsolute => 0,
            Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop => 1,
            Opcode::ForIter => 1,
            Opcode::SetupFinally => 0,
            Opcode::SetupWith => 1,
        }
    }

    /// Net stack effect. `jump` selects the jump-taken profile for the
    /// opcodes where it differs from fallthrough.
    pub fn stack_effect(self, oparg: u32, jump: bool) -> i32 {
        let oparg = oparg as i32;
        match self {
            Opcode::Nop | Opcode::ExtendedArg => 0,

            Opcode::PopTop => -1,
            Opcode::RotTwo | Opcode::RotThree | Opcode::RotFour => 0,
            Opcode::DupTop => 1,
            Opcode::DupTopTwo => 2,

            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert
            | Opcode::GetIter => 0,

            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplacePower
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr
            | Opcode::CompareOp => -1,

            Opcode::StoreSubscr => -3,
            Opcode::DeleteSubscr => -2,

            Opcode::ReturnValue => -1,
            Opcode::YieldValue => 0,
            Opcode::RaiseVarargs => -oparg,
            Opcode::Reraise => -3,
            Opcode::PopBlock => 0,
            Opcode::PopExcept => -3,

            Opcode::LoadConst
            | Opcode::LoadFast
            | Opcode::LoadName
            | Opcode::LoadGlobal => 1,
            Opcode::StoreFast | Opcode::StoreName | Opcode::StoreGlobal => -1,
            Opcode::DeleteFast | Opcode::DeleteName | Opcode::DeleteGlobal => 0,
            Opcode::LoadAttr => 0,
            Opcode::LoadMethod => 1,
            Opcode::StoreAttr => -2,
            Opcode::DeleteAttr => -1,

            Opcode::BuildTuple
            | Opcode::BuildList
            | Opcode::BuildSet
            | Opcode::BuildString => 1 - oparg,
            Opcode::BuildMap => 1 - 2 * oparg,
            Opcode::BuildSlice => {
                if oparg == 3 {
                    -2
                } else {
                    -1
                }
            }
            Opcode::UnpackSequence => oparg - 1,
            Opcode::UnpackEx => (oparg & 0xff) + (oparg >> 8),
            Opcode::ListAppend | Opcode::SetAdd => -1,
            Opcode::MapAdd => -2,

            Opcode::CallFunction => -oparg,
            Opcode::CallFunctionKw => -oparg - 1,
            Opcode::CallMethod => -oparg - 1,
            Opcode::MakeFunction => -1 - (oparg & 0x0f).count_ones() as i32,

            Opcode::JumpForward | Opcode::JumpAbsolute => 0,
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => -1,
            // -1 at end of iteration, +1 while iterating.
            Opcode::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            // The handler entry restores the stack and pushes the exception
            // state before jumping.
            Opcode::SetupFinally => {
                if jump {
                    6
                } else {
                    0
                }
            }
            Opcode::SetupWith => {
                if jump {
                    6
                } else {
                    1
                }
            }
        }
    }

    /// Static name for listings and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::ExtendedArg => "EXTENDED_ARG",
            Opcode::PopTop => "POP_TOP",
            Opcode::RotTwo => "ROT_TWO",
            Opcode::RotThree => "ROT_THREE",
            Opcode::RotFour => "ROT_FOUR",
            Opcode::DupTop => "DUP_TOP",
            Opcode::DupTopTwo => "DUP_TOP_TWO",
            Opcode::UnaryPositive => "UNARY_POSITIVE",
            Opcode::UnaryNegative => "UNARY_NEGATIVE",
            Opcode::UnaryNot => "UNARY_NOT",
            Opcode::UnaryInvert => "UNARY_INVERT",
            Opcode::GetIter => "GET_ITER",
            Opcode::BinaryPower => "BINARY_POWER",
            Opcode::BinaryMultiply => "BINARY_MULTIPLY",
            Opcode::BinaryModulo => "BINARY_MODULO",
            Opcode::BinaryAdd => "BINARY_ADD",
            Opcode::BinarySubtract => "BINARY_SUBTRACT",
            Opcode::BinarySubscr => "BINARY_SUBSCR",
            Opcode::BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            Opcode::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Opcode::BinaryLshift => "BINARY_LSHIFT",
            Opcode::BinaryRshift => "BINARY_RSHIFT",
            Opcode::BinaryAnd => "BINARY_AND",
            Opcode::BinaryXor => "BINARY_XOR",
            Opcode::BinaryOr => "BINARY_OR",
            Opcode::InplacePower => "INPLACE_POWER",
            Opcode::InplaceMultiply => "INPLACE_MULTIPLY",
            Opcode::InplaceModulo => "INPLACE_MODULO",
            Opcode::InplaceAdd => "INPLACE_ADD",
            Opcode::InplaceSubtract => "INPLACE_SUBTRACT",
            Opcode::InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            Opcode::InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Opcode::InplaceLshift => "INPLACE_LSHIFT",
            Opcode::InplaceRshift => "INPLACE_RSHIFT",
            Opcode::InplaceAnd => "INPLACE_AND",
            Opcode::InplaceXor => "INPLACE_XOR",
            Opcode::InplaceOr => "INPLACE_OR",
            Opcode::StoreSubscr => "STORE_SUBSCR",
            Opcode::DeleteSubscr => "DELETE_SUBSCR",
            Opcode::CompareOp => "COMPARE_OP",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::YieldValue => "YIELD_VALUE",
            Opcode::RaiseVarargs => "RAISE_VARARGS",
            Opcode::Reraise => "RERAISE",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::PopExcept => "POP_EXCEPT",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::DeleteFast => "DELETE_FAST",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreName => "STORE_NAME",
            Opcode::DeleteName => "DELETE_NAME",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::StoreGlobal => "STORE_GLOBAL",
            Opcode::DeleteGlobal => "DELETE_GLOBAL",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::StoreAttr => "STORE_ATTR",
            Opcode::DeleteAttr => "DELETE_ATTR",
            Opcode::LoadMethod => "LOAD_METHOD",
            Opcode::BuildTuple => "BUILD_TUPLE",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::BuildSet => "BUILD_SET",
            Opcode::BuildMap => "BUILD_MAP",
            Opcode::BuildString => "BUILD_STRING",
            Opcode::BuildSlice => "BUILD_SLICE",
            Opcode::UnpackSequence => "UNPACK_SEQUENCE",
            Opcode::UnpackEx => "UNPACK_EX",
            Opcode::ListAppend => "LIST_APPEND",
            Opcode::SetAdd => "SET_ADD",
            Opcode::MapAdd => "MAP_ADD",
            Opcode::CallFunction => "CALL_FUNCTION",
            Opcode::CallFunctionKw => "CALL_FUNCTION_KW",
            Opcode::CallMethod => "CALL_METHOD",
            Opcode::MakeFunction => "MAKE_FUNCTION",
            Opcode::JumpForward => "JUMP_FORWARD",
            Opcode::JumpAbsolute => "JUMP_ABSOLUTE",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Opcode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Opcode::ForIter => "FOR_ITER",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::SetupWith => "SETUP_WITH",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of code units needed to encode `oparg`: the instruction itself
/// plus one `EXTENDED_ARG` prefix per extra byte.
pub fn instrsize(oparg: u32) -> u8 {
    1 + (oparg > 0xff) as u8 + (oparg > 0xffff) as u8 + (oparg > 0xff_ffff) as u8
}
