//! Firmware file decoders.
//!
//! All three formats produce the same [`RawMemory`](crate::RawMemory) model:
//! Intel HEX and Motorola S-record are line-oriented text, the DFU/DfuSe
//! container is binary with a trailing suffix.

mod dfu_file;
mod error;
mod intel_hex;
mod srec;

pub use dfu_file::{
    DFUSE_DFU_VERSION, DfuFile, PLAIN_DFU_VERSION, RAW_IMAGE_ADDRESS, SUFFIX_LENGTH, Suffix,
    TargetImage, parse_dfu_file,
};
pub use error::ParseError;
pub use intel_hex::parse_intel_hex;
pub use srec::parse_srec;

use crate::memory::{RawMemory, Segment};

/// Shared state of the line-oriented decoders: the run of bytes being
/// accumulated and the memory it flushes into.
struct SegmentAccumulator {
    memory: RawMemory,
    current: Option<Segment>,
}

impl SegmentAccumulator {
    fn new() -> Self {
        Self {
            memory: RawMemory::new(),
            current: None,
        }
    }

    /// Extend the accumulated segment when `address` continues it, otherwise
    /// flush and start a new one.
    fn push(&mut self, address: u64, data: &[u8]) -> Result<(), ParseError> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.current {
            Some(seg) if seg.end_address().checked_add(1) == Some(address) => {
                seg.data.extend_from_slice(data);
                Ok(())
            }
            _ => {
                self.flush()?;
                self.current = Some(Segment::new(address, data.to_vec()));
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<(), ParseError> {
        if let Some(seg) = self.current.take() {
            let address = seg.start_address;
            if !self.memory.try_add(seg) {
                return Err(ParseError::Overlap { address });
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<RawMemory, ParseError> {
        self.flush()?;
        Ok(self.memory)
    }
}

fn hex_digit(c: u8, line: usize) -> Result<u8, ParseError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ParseError::InvalidHexDigit {
            line,
            char: c as char,
        }),
    }
}

fn parse_hex_bytes(text: &[u8], line: usize) -> Result<Vec<u8>, ParseError> {
    if !text.len().is_multiple_of(2) {
        return Err(ParseError::InvalidRecord {
            line,
            message: "odd number of hex digits".to_string(),
        });
    }
    let mut bytes = Vec::with_capacity(text.len() / 2);
    for pair in text.chunks_exact(2) {
        let high = hex_digit(pair[0], line)?;
        let low = hex_digit(pair[1], line)?;
        bytes.push((high << 4) | low);
    }
    Ok(bytes)
}
