//! # Bytecodes
//!
//! The Wisp interpreter's bytecode set, with the per-opcode metadata the
//! compiler needs: encoded size, operand format, fixed stack delta and
//! branch classification.
//!
//! Operand formats:
//!
//! | Format | Encoding |
//! |--------|----------|
//! | `""`   | no operands |
//! | `"B"`  | one unsigned byte |
//! | `"I"`  | one little-endian i32 |
//! | `"BB"` | two unsigned bytes |
//! | `"BI"` | unsigned byte, then little-endian i32 |
//!
//! Stack deltas are a table lookup for most opcodes; the variable-delta
//! opcodes (invokes, drops, allocates) are resolved by the stack-height
//! explorer, which has the function and program context the delta depends
//! on.

use crate::diagnostics::{Diagnostic, ErrorCode};

/// The stack delta of an opcode: fixed, or dependent on its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDiff {
    /// The delta is the same at every occurrence.
    Fixed(i32),
    /// The delta depends on operands (selector arity, drop count, ...).
    Var,
}

macro_rules! bytecodes {
    ($( $name:ident = $value:literal, size $size:literal, diff $diff:expr, format $format:literal, $mnemonic:literal; )*) => {
        /// A bytecode opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $name = $value, )*
        }

        impl Opcode {
            /// Decode an opcode from its byte value.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $value => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Encoded size in bytes, including the opcode byte.
            pub fn size(self) -> usize {
                match self {
                    $( Opcode::$name => $size, )*
                }
            }

            /// The stack delta, when it is operand-independent.
            pub fn stack_diff(self) -> StackDiff {
                match self {
                    $( Opcode::$name => $diff, )*
                }
            }

            /// The operand format string.
            pub fn format(self) -> &'static str {
                match self {
                    $( Opcode::$name => $format, )*
                }
            }

            /// Human-readable mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }
        }
    };
}

use StackDiff::{Fixed, Var};

bytecodes! {
    LoadLocal0 = 0, size 1, diff Fixed(1), format "", "load local 0";
    LoadLocal1 = 1, size 1, diff Fixed(1), format "", "load local 1";
    LoadLocal2 = 2, size 1, diff Fixed(1), format "", "load local 2";
    LoadLocal3 = 3, size 1, diff Fixed(1), format "", "load local 3";
    LoadLocal4 = 4, size 1, diff Fixed(1), format "", "load local 4";
    LoadLocal5 = 5, size 1, diff Fixed(1), format "", "load local 5";
    LoadLocal = 6, size 2, diff Fixed(1), format "B", "load local";
    LoadLocalWide = 7, size 5, diff Fixed(1), format "I", "load local wide";
    LoadBoxed = 8, size 2, diff Fixed(1), format "B", "load boxed";
    LoadStatic = 9, size 5, diff Fixed(1), format "I", "load static";
    LoadStaticInit = 10, size 5, diff Fixed(1), format "I", "load static init";
    LoadField = 11, size 2, diff Fixed(0), format "B", "load field";
    LoadFieldWide = 12, size 5, diff Fixed(0), format "I", "load field wide";
    StoreLocal = 13, size 2, diff Fixed(0), format "B", "store local";
    StoreBoxed = 14, size 2, diff Fixed(0), format "B", "store boxed";
    StoreStatic = 15, size 5, diff Fixed(0), format "I", "store static";
    StoreField = 16, size 2, diff Fixed(-1), format "B", "store field";
    StoreFieldWide = 17, size 5, diff Fixed(-1), format "I", "store field wide";
    LoadLiteralNull = 18, size 1, diff Fixed(1), format "", "load literal null";
    LoadLiteralTrue = 19, size 1, diff Fixed(1), format "", "load literal true";
    LoadLiteralFalse = 20, size 1, diff Fixed(1), format "", "load literal false";
    LoadLiteral0 = 21, size 1, diff Fixed(1), format "", "load literal 0";
    LoadLiteral1 = 22, size 1, diff Fixed(1), format "", "load literal 1";
    LoadLiteral = 23, size 2, diff Fixed(1), format "B", "load literal";
    LoadLiteralWide = 24, size 5, diff Fixed(1), format "I", "load literal wide";
    LoadConst = 25, size 5, diff Fixed(1), format "I", "load const";
    InvokeMethod = 26, size 5, diff Var, format "I", "invoke method";
    InvokeNoSuchMethod = 27, size 5, diff Var, format "I", "invoke no such method";
    InvokeTestNoSuchMethod = 28, size 5, diff Fixed(0), format "I", "invoke test no such method";
    InvokeTest = 29, size 5, diff Fixed(0), format "I", "invoke test";
    InvokeSelector = 30, size 2, diff Var, format "B", "invoke selector";
    InvokeStatic = 31, size 5, diff Var, format "I", "invoke static";
    InvokeFactory = 32, size 5, diff Var, format "I", "invoke factory";
    InvokeNative = 33, size 3, diff Fixed(1), format "BB", "invoke native";
    InvokeDetachableNative = 34, size 3, diff Fixed(1), format "BB", "invoke detachable native";
    InvokeEq = 35, size 5, diff Fixed(-1), format "I", "invoke eq";
    InvokeLt = 36, size 5, diff Fixed(-1), format "I", "invoke lt";
    InvokeLe = 37, size 5, diff Fixed(-1), format "I", "invoke le";
    InvokeGt = 38, size 5, diff Fixed(-1), format "I", "invoke gt";
    InvokeGe = 39, size 5, diff Fixed(-1), format "I", "invoke ge";
    InvokeAdd = 40, size 5, diff Fixed(-1), format "I", "invoke add";
    InvokeSub = 41, size 5, diff Fixed(-1), format "I", "invoke sub";
    InvokeMod = 42, size 5, diff Fixed(-1), format "I", "invoke mod";
    InvokeMul = 43, size 5, diff Fixed(-1), format "I", "invoke mul";
    InvokeTruncDiv = 44, size 5, diff Fixed(-1), format "I", "invoke trunc div";
    InvokeBitNot = 45, size 5, diff Fixed(0), format "I", "invoke bit not";
    InvokeBitAnd = 46, size 5, diff Fixed(-1), format "I", "invoke bit and";
    InvokeBitOr = 47, size 5, diff Fixed(-1), format "I", "invoke bit or";
    InvokeBitXor = 48, size 5, diff Fixed(-1), format "I", "invoke bit xor";
    InvokeBitShr = 49, size 5, diff Fixed(-1), format "I", "invoke bit shr";
    InvokeBitShl = 50, size 5, diff Fixed(-1), format "I", "invoke bit shl";
    Pop = 51, size 1, diff Fixed(-1), format "", "pop";
    Drop = 52, size 2, diff Var, format "B", "drop";
    Negate = 53, size 1, diff Fixed(0), format "", "negate";
    StackOverflowCheck = 54, size 5, diff Fixed(0), format "I", "stack overflow check";
    BranchWide = 55, size 5, diff Fixed(0), format "I", "branch wide";
    BranchIfTrueWide = 56, size 5, diff Fixed(-1), format "I", "branch if true wide";
    BranchIfFalseWide = 57, size 5, diff Fixed(-1), format "I", "branch if false wide";
    BranchBack = 58, size 2, diff Fixed(0), format "B", "branch back";
    BranchBackIfTrue = 59, size 2, diff Fixed(-1), format "B", "branch back if true";
    BranchBackIfFalse = 60, size 2, diff Fixed(-1), format "B", "branch back if false";
    BranchBackWide = 61, size 5, diff Fixed(0), format "I", "branch back wide";
    BranchBackIfTrueWide = 62, size 5, diff Fixed(-1), format "I", "branch back if true wide";
    BranchBackIfFalseWide = 63, size 5, diff Fixed(-1), format "I", "branch back if false wide";
    PopAndBranchWide = 64, size 6, diff Var, format "BI", "pop and branch wide";
    PopAndBranchBackWide = 65, size 6, diff Var, format "BI", "pop and branch back wide";
    Allocate = 66, size 5, diff Var, format "I", "allocate";
    AllocateImmutable = 67, size 5, diff Var, format "I", "allocate immutable";
    AllocateBoxed = 68, size 1, diff Fixed(0), format "", "allocate boxed";
    Identical = 69, size 1, diff Fixed(-1), format "", "identical";
    IdenticalNonNumeric = 70, size 1, diff Fixed(-1), format "", "identical non numeric";
    EnterNoSuchMethod = 71, size 2, diff Var, format "B", "enter no such method";
    ExitNoSuchMethod = 72, size 1, diff Fixed(-1), format "", "exit no such method";
    SubroutineCall = 73, size 5, diff Var, format "I", "subroutine call";
    SubroutineReturn = 74, size 1, diff Fixed(-1), format "", "subroutine return";
    ProcessYield = 75, size 1, diff Fixed(0), format "", "process yield";
    CoroutineChange = 76, size 1, diff Fixed(-1), format "", "coroutine change";
    Throw = 77, size 1, diff Fixed(0), format "", "throw";
    Return = 78, size 1, diff Fixed(-1), format "", "return";
    ReturnNull = 79, size 1, diff Fixed(0), format "", "return null";
    MethodEnd = 80, size 1, diff Fixed(0), format "", "method end";
}

impl Opcode {
    /// Whether this opcode transfers control and therefore ends a basic
    /// block unconditionally or with explicit targets.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::BranchWide
                | Opcode::BranchIfTrueWide
                | Opcode::BranchIfFalseWide
                | Opcode::BranchBack
                | Opcode::BranchBackIfTrue
                | Opcode::BranchBackIfFalse
                | Opcode::BranchBackWide
                | Opcode::BranchBackIfTrueWide
                | Opcode::BranchBackIfFalseWide
                | Opcode::PopAndBranchWide
                | Opcode::PopAndBranchBackWide
                | Opcode::SubroutineCall
                | Opcode::Return
        )
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Decodes opcodes and operands out of a bytecode stream.
#[derive(Debug, Clone, Copy)]
pub struct BytecodeReader<'a> {
    bytecode: &'a [u8],
}

impl<'a> BytecodeReader<'a> {
    pub fn new(bytecode: &'a [u8]) -> Self {
        Self { bytecode }
    }

    /// The opcode at `bci`.
    pub fn opcode_at(&self, bci: u32) -> Result<Opcode, Diagnostic> {
        let byte = *self.bytecode.get(bci as usize).ok_or_else(|| {
            Diagnostic::error_with_code(
                ErrorCode::MalformedBytecode,
                format!("bytecode index {} past end of stream", bci),
            )
        })?;
        Opcode::from_byte(byte).ok_or_else(|| {
            Diagnostic::error_with_code(
                ErrorCode::MalformedBytecode,
                format!("unknown opcode {:#04x} at bci {}", byte, bci),
            )
        })
    }

    /// The unsigned byte operand at `bci + offset`.
    pub fn read_u8(&self, bci: u32, offset: usize) -> Result<u8, Diagnostic> {
        self.bytecode
            .get(bci as usize + offset)
            .copied()
            .ok_or_else(|| {
                Diagnostic::error_with_code(
                    ErrorCode::MalformedBytecode,
                    format!("truncated operand at bci {}", bci),
                )
            })
    }

    /// The little-endian i32 operand at `bci + offset`.
    pub fn read_i32(&self, bci: u32, offset: usize) -> Result<i32, Diagnostic> {
        let start = bci as usize + offset;
        let bytes = self.bytecode.get(start..start + 4).ok_or_else(|| {
            Diagnostic::error_with_code(
                ErrorCode::MalformedBytecode,
                format!("truncated operand at bci {}", bci),
            )
        })?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// A readable rendering of the instruction at `bci`, for diagnostics
    /// and the unsupported-opcode trap.
    pub fn bytecode_string(&self, bci: u32) -> String {
        let opcode = match self.opcode_at(bci) {
            Ok(opcode) => opcode,
            Err(_) => return format!("<bad opcode at {}>", bci),
        };
        let render = |operands: &[i64]| {
            let mut out = String::from(opcode.mnemonic());
            for operand in operands {
                out.push_str(&format!(" {}", operand));
            }
            out
        };
        match opcode.format() {
            "" => render(&[]),
            "B" => match self.read_u8(bci, 1) {
                Ok(b) => render(&[b as i64]),
                Err(_) => render(&[]),
            },
            "I" => match self.read_i32(bci, 1) {
                Ok(i) => render(&[i as i64]),
                Err(_) => render(&[]),
            },
            "BB" => match (self.read_u8(bci, 1), self.read_u8(bci, 2)) {
                (Ok(a), Ok(b)) => render(&[a as i64, b as i64]),
                _ => render(&[]),
            },
            "BI" => match (self.read_u8(bci, 1), self.read_i32(bci, 2)) {
                (Ok(a), Ok(b)) => render(&[a as i64, b as i64]),
                _ => render(&[]),
            },
            other => format!("<unknown bytecode format {}>", other),
        }
    }
}

// ============================================================================
// Assembling
// ============================================================================

/// Builds bytecode streams. Snapshot construction and tests only; the
/// compiler itself never emits bytecode.
#[derive(Debug, Default)]
pub struct BytecodeAssembler {
    bytes: Vec<u8>,
}

impl BytecodeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position (the bci of the next emitted opcode).
    pub fn position(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Emit an opcode without operands.
    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        self.bytes.push(opcode as u8);
        self
    }

    /// Emit an opcode with a single byte operand.
    pub fn emit_u8(&mut self, opcode: Opcode, operand: u8) -> &mut Self {
        self.bytes.push(opcode as u8);
        self.bytes.push(operand);
        self
    }

    /// Emit an opcode with a single i32 operand.
    pub fn emit_i32(&mut self, opcode: Opcode, operand: i32) -> &mut Self {
        self.bytes.push(opcode as u8);
        self.bytes.extend_from_slice(&operand.to_le_bytes());
        self
    }

    /// Emit an opcode with two byte operands.
    pub fn emit_u8_u8(&mut self, opcode: Opcode, first: u8, second: u8) -> &mut Self {
        self.bytes.push(opcode as u8);
        self.bytes.push(first);
        self.bytes.push(second);
        self
    }

    /// Emit an opcode with a byte operand followed by an i32 operand.
    pub fn emit_u8_i32(&mut self, opcode: Opcode, first: u8, second: i32) -> &mut Self {
        self.bytes.push(opcode as u8);
        self.bytes.push(first);
        self.bytes.extend_from_slice(&second.to_le_bytes());
        self
    }

    /// Finish, returning the bytecode stream.
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(opcode) = Opcode::from_byte(byte) {
                assert_eq!(opcode as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(Opcode::MethodEnd as u8), Some(Opcode::MethodEnd));
        assert_eq!(Opcode::from_byte(0xff), None);
    }

    #[test]
    fn sizes_match_formats() {
        for byte in 0..=u8::MAX {
            let Some(opcode) = Opcode::from_byte(byte) else { continue };
            let operand_bytes = match opcode.format() {
                "" => 0,
                "B" => 1,
                "I" => 4,
                "BB" => 2,
                "BI" => 5,
                other => panic!("unexpected format {:?}", other),
            };
            assert_eq!(opcode.size(), 1 + operand_bytes, "size mismatch for {:?}", opcode);
        }
    }

    #[test]
    fn reader_decodes_operands() {
        let mut asm = BytecodeAssembler::new();
        asm.emit_u8(Opcode::LoadLocal, 4)
            .emit_i32(Opcode::InvokeMethod, 0x1234)
            .emit_u8_i32(Opcode::PopAndBranchWide, 2, -7)
            .emit(Opcode::MethodEnd);
        let bytes = asm.finish();
        let reader = BytecodeReader::new(&bytes);

        assert_eq!(reader.opcode_at(0).unwrap(), Opcode::LoadLocal);
        assert_eq!(reader.read_u8(0, 1).unwrap(), 4);

        assert_eq!(reader.opcode_at(2).unwrap(), Opcode::InvokeMethod);
        assert_eq!(reader.read_i32(2, 1).unwrap(), 0x1234);

        assert_eq!(reader.opcode_at(7).unwrap(), Opcode::PopAndBranchWide);
        assert_eq!(reader.read_u8(7, 1).unwrap(), 2);
        assert_eq!(reader.read_i32(7, 2).unwrap(), -7);

        assert_eq!(reader.opcode_at(13).unwrap(), Opcode::MethodEnd);
    }

    #[test]
    fn reader_rejects_garbage() {
        let bytes = vec![0xfe];
        let reader = BytecodeReader::new(&bytes);
        assert!(reader.opcode_at(0).is_err());
        assert!(reader.opcode_at(9).is_err());

        // Truncated i32 operand.
        let bytes = vec![Opcode::InvokeMethod as u8, 1, 2];
        let reader = BytecodeReader::new(&bytes);
        assert!(reader.read_i32(0, 1).is_err());
    }

    #[test]
    fn bytecode_string_renders_operands() {
        let mut asm = BytecodeAssembler::new();
        asm.emit_u8(Opcode::Drop, 3).emit(Opcode::ReturnNull);
        let bytes = asm.finish();
        let reader = BytecodeReader::new(&bytes);
        assert_eq!(reader.bytecode_string(0), "drop 3");
        assert_eq!(reader.bytecode_string(2), "return null");
    }

    #[test]
    fn branch_classification() {
        assert!(Opcode::BranchWide.is_branch());
        assert!(Opcode::PopAndBranchBackWide.is_branch());
        assert!(Opcode::Return.is_branch());
        assert!(!Opcode::ReturnNull.is_branch());
        assert!(!Opcode::InvokeMethod.is_branch());
    }
}
