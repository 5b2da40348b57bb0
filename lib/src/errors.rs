use crate::cil::{InstrId, Opcode};
use crate::metadata::Token;
use std::fmt;
use std::string::FromUtf8Error;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// File or structure does not start with the expected magic bytes
    BadMagic {
        expected: &'static [u8],
        found: Vec<u8>,
    },

    /// PE optional header magic we don't know how to read
    UnsupportedVersion(u16),

    /// PE image or CLI metadata that is inconsistent or truncated
    MalformedImage(String),

    /// Valid image that uses a feature this crate can't rewrite
    UnsupportedImage(String),

    /// Signature blob that doesn't follow the signature grammar
    InvalidSignature(String),

    /// A metadata heap ran out of addressable space
    HeapFull { heap: &'static str, size: usize },

    MalformedString(FromUtf8Error),

    /// Unknown opcode (two-byte opcodes are reported with their `0xFE` prefix)
    InvalidOpcode { offset: u32, opcode: u16 },

    /// The IL stream ends in the middle of an instruction
    TruncatedCode { offset: u32 },

    /// A branch or exception clause points somewhere that isn't the start of an instruction
    BranchOutOfBody { offset: u32, target: i64 },

    /// Operand doesn't have the shape the opcode expects
    MismatchedOperand(Opcode),

    /// Exception clause kind that isn't catch, filter, finally, or fault
    InvalidClause(u16),

    /// A token refers to the wrong table or to a row that doesn't exist
    InvalidToken(Token),

    /// A handle that is no longer part of the method body layout is still referenced
    UnresolvedHandle(InstrId),

    /// Encoded method code does not fit in the container
    CodeTooLarge(usize),

    /// Callee names must look like `[Assembly]Namespace.Type::Method`
    MalformedCallee(String),

    /// Debug symbols don't line up with the assembly they belong to
    InvalidSymbols(String),

    /// Debug symbols in a format that can't be rewritten (eg. Windows PDB)
    UnsupportedSymbols(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::BadMagic { expected, found } => write!(
                f,
                "bad magic bytes {:02X?} (expected {:02X?})",
                found, expected
            ),
            Error::UnsupportedVersion(magic) => {
                write!(f, "unsupported optional header magic 0x{:X}", magic)
            }
            Error::MalformedImage(msg) => write!(f, "malformed image: {}", msg),
            Error::UnsupportedImage(msg) => write!(f, "unsupported image: {}", msg),
            Error::InvalidSignature(msg) => write!(f, "invalid signature: {}", msg),
            Error::HeapFull { heap, size } => {
                write!(f, "{} heap is full ({} bytes)", heap, size)
            }
            Error::MalformedString(err) => write!(f, "malformed string: {}", err),
            Error::InvalidOpcode { offset, opcode } => {
                write!(f, "invalid opcode 0x{:X} at IL_{:04x}", opcode, offset)
            }
            Error::TruncatedCode { offset } => {
                write!(f, "code ends in the middle of the instruction at IL_{:04x}", offset)
            }
            Error::BranchOutOfBody { offset, target } => write!(
                f,
                "instruction at IL_{:04x} targets offset {} which is not an instruction boundary",
                offset, target
            ),
            Error::MismatchedOperand(opcode) => {
                write!(f, "operand does not fit opcode '{}'", opcode.mnemonic())
            }
            Error::InvalidClause(kind) => write!(f, "invalid exception clause kind 0x{:X}", kind),
            Error::InvalidToken(token) => write!(f, "invalid token {:?}", token),
            Error::UnresolvedHandle(id) => {
                write!(f, "instruction {:?} is referenced but not in the method body", id)
            }
            Error::CodeTooLarge(len) => write!(f, "method code of {} bytes is too large", len),
            Error::MalformedCallee(name) => write!(f, "malformed callee name '{}'", name),
            Error::InvalidSymbols(msg) => write!(f, "invalid debug symbols: {}", msg),
            Error::UnsupportedSymbols(format) => {
                write!(f, "unsupported debug symbol format: {}", format)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Error {
        Error::MalformedString(err)
    }
}
