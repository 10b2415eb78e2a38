use super::{ParseError, SegmentAccumulator, parse_hex_bytes};
use crate::memory::RawMemory;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Parse Intel HEX input into a [`RawMemory`].
///
/// Handles data, EOF, extended segment and extended linear address records;
/// start-address records are checksum-verified and skipped.
pub fn parse_intel_hex(input: &[u8]) -> Result<RawMemory, ParseError> {
    let mut acc = SegmentAccumulator::new();
    let mut extended_address: u64 = 0;
    let mut eof_seen = false;

    for (idx, raw_line) in input.split(|&b| b == b'\n').enumerate() {
        let line = idx + 1;
        let mut text = raw_line;
        if let Some(b'\r') = text.last() {
            text = &text[..text.len() - 1];
        }
        if text.is_empty() {
            continue;
        }
        if eof_seen {
            return Err(ParseError::InvalidRecord {
                line,
                message: "data after EOF record".to_string(),
            });
        }
        if text[0] != b':' {
            return Err(ParseError::InvalidRecord {
                line,
                message: "line does not start with ':'".to_string(),
            });
        }

        let bytes = parse_hex_bytes(&text[1..], line)?;
        if bytes.len() < 5 {
            return Err(ParseError::InvalidRecord {
                line,
                message: "record too short".to_string(),
            });
        }
        validate_checksum(&bytes, line)?;

        let byte_count = bytes[0] as usize;
        let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        if bytes.len() != 5 + byte_count {
            return Err(ParseError::InvalidRecord {
                line,
                message: format!(
                    "byte count mismatch: header says {}, got {}",
                    byte_count,
                    bytes.len() - 5
                ),
            });
        }
        let data = &bytes[4..4 + byte_count];

        match record_type {
            RECORD_DATA => {
                acc.push(extended_address + offset as u64, data)?;
            }
            RECORD_EOF => {
                eof_seen = true;
            }
            RECORD_EXTENDED_SEGMENT => {
                let base = base_value(data, line)?;
                extended_address = (base as u64) << 4;
            }
            RECORD_EXTENDED_LINEAR => {
                let base = base_value(data, line)?;
                extended_address = (base as u64) << 16;
            }
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
            _ => {
                return Err(ParseError::UnsupportedRecordType { line, record_type });
            }
        }
    }

    if !eof_seen {
        return Err(ParseError::UnexpectedEof);
    }

    acc.finish()
}

fn base_value(data: &[u8], line: usize) -> Result<u16, ParseError> {
    if data.len() != 2 {
        return Err(ParseError::InvalidRecord {
            line,
            message: "address record must have 2 data bytes".to_string(),
        });
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

fn validate_checksum(bytes: &[u8], line: usize) -> Result<(), ParseError> {
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        let actual = *bytes.last().unwrap();
        let expected = (!bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b)))
        .wrapping_add(1);
        return Err(ParseError::ChecksumMismatch {
            line,
            expected,
            actual,
        });
    }
    Ok(())
}
