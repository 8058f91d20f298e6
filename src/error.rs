//! Kestrel error types.

use std::fmt;

/// Crate-wide result type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Kestrel error type.
#[derive(Debug)]
pub enum Error {
    /// An error in the use-def analysis.
    Analysis(String),
    /// The underlying disassembler rejected an encoding.
    Bad64(bad64::DecodeError),
    /// A chunk id did not resolve in the program arena.
    ChunkNotFound(usize),
    /// An instruction could not be rebuilt from archive bytes.
    DisassemblyFailure,
    /// The archive stream ended mid-record.
    EndOfStream,
    /// A control flow graph node id did not exist.
    GraphNodeNotFound(usize),
    /// An operand was not of the kind its addressing mode implies.
    MalformedOperands(String),
    /// An archive record carried a tag this build cannot reconstruct.
    UnsupportedArchiveTag(u8),
    /// An instruction form explicitly marked unsupported was encountered.
    UnsupportedInstruction(String),
    /// A relocation type on the hard-reject blacklist was encountered.
    UnsupportedRelocation(String),
    /// An unsupported shift/extend kind was encountered.
    UnsupportedShift(String),
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Analysis(m) => write!(f, "Analysis error: {}", m),
            Error::Bad64(e) => write!(f, "Decoder error: {}", e),
            Error::ChunkNotFound(id) => write!(f, "Chunk {} does not exist", id),
            Error::DisassemblyFailure => write!(f, "Disassembly failure"),
            Error::EndOfStream => write!(f, "Unexpected end of archive stream"),
            Error::GraphNodeNotFound(id) => {
                write!(f, "Control flow node {} does not exist", id)
            }
            Error::MalformedOperands(m) => write!(f, "Malformed operands: {}", m),
            Error::UnsupportedArchiveTag(tag) => {
                write!(f, "Unsupported archive tag {}", tag)
            }
            Error::UnsupportedInstruction(m) => {
                write!(f, "Unsupported instruction: {}", m)
            }
            Error::UnsupportedRelocation(m) => {
                write!(f, "Unsupported relocation: {}", m)
            }
            Error::UnsupportedShift(m) => write!(f, "Unsupported shift: {}", m),
            Error::Custom(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for Error {}

impl From<bad64::DecodeError> for Error {
    fn from(error: bad64::DecodeError) -> Error {
        Error::Bad64(error)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Error {
        Error::Custom(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Error {
        Error::Custom(message.to_string())
    }
}
