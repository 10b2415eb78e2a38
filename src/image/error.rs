use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid record at line {line}: {message}")]
    InvalidRecord { line: usize, message: String },

    #[error("checksum mismatch at line {line}: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch {
        line: usize,
        expected: u8,
        actual: u8,
    },

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid hex digit at line {line}: {char}")]
    InvalidHexDigit { line: usize, char: char },

    #[error("unsupported record type at line {line}: {record_type:02X}")]
    UnsupportedRecordType { line: usize, record_type: u8 },

    #[error("overlapping data at address {address:#X}")]
    Overlap { address: u64 },

    #[error("bad file format: {0}")]
    BadFormat(String),

    #[error("suffix CRC mismatch: computed {computed:08X}, stored {stored:08X}")]
    BadCrc { computed: u32, stored: u32 },
}

impl From<WireError> for ParseError {
    fn from(error: WireError) -> Self {
        Self::BadFormat(error.to_string())
    }
}
