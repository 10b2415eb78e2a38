use super::{ParseError, SegmentAccumulator, parse_hex_bytes};
use crate::memory::RawMemory;

/// Parse Motorola S-record input into a [`RawMemory`].
///
/// Data records S1/S2/S3 contribute bytes; start-address records S7/S8/S9
/// flush the accumulated segment; the S0 header is verified and skipped;
/// S5/S6 record counts are checked against the number of data records seen.
pub fn parse_srec(input: &[u8]) -> Result<RawMemory, ParseError> {
    let mut acc = SegmentAccumulator::new();
    let mut data_records: u32 = 0;

    for (idx, raw_line) in input.split(|&b| b == b'\n').enumerate() {
        let line = idx + 1;
        let mut text = raw_line;
        if let Some(b'\r') = text.last() {
            text = &text[..text.len() - 1];
        }
        if text.is_empty() {
            continue;
        }
        if (text[0] != b'S' && text[0] != b's') || text.len() < 2 {
            return Err(ParseError::InvalidRecord {
                line,
                message: "missing S-record prefix".to_string(),
            });
        }

        let record_type = text[1];
        let bytes = parse_hex_bytes(&text[2..], line)?;
        if bytes.is_empty() {
            return Err(ParseError::InvalidRecord {
                line,
                message: "missing record length".to_string(),
            });
        }
        let count = bytes[0] as usize;
        if bytes.len() != count + 1 {
            return Err(ParseError::InvalidRecord {
                line,
                message: format!("byte count mismatch: expected {}, got {}", count + 1, bytes.len()),
            });
        }
        validate_checksum(&bytes, line)?;

        let addr_len = match record_type {
            b'0' | b'1' | b'5' | b'9' => 2,
            b'2' | b'6' | b'8' => 3,
            b'3' | b'7' => 4,
            other => {
                return Err(ParseError::UnsupportedRecordType {
                    line,
                    record_type: other,
                });
            }
        };
        if count < addr_len + 1 {
            return Err(ParseError::InvalidRecord {
                line,
                message: "record length too short".to_string(),
            });
        }
        let address = parse_address(&bytes[1..1 + addr_len]);
        let data = &bytes[1 + addr_len..bytes.len() - 1];

        match record_type {
            b'1' | b'2' | b'3' => {
                data_records += 1;
                acc.push(address, data)?;
            }
            b'5' | b'6' => {
                if address as u32 != data_records {
                    return Err(ParseError::InvalidRecord {
                        line,
                        message: format!(
                            "record count mismatch: file says {}, saw {}",
                            address, data_records
                        ),
                    });
                }
            }
            b'7' | b'8' | b'9' => {
                acc.flush()?;
            }
            _ => {} // S0 header, verified above
        }
    }

    acc.finish()
}

fn parse_address(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn validate_checksum(bytes: &[u8], line: usize) -> Result<(), ParseError> {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0xFF {
        let actual = *bytes.last().unwrap();
        let expected = 0xFFu8.wrapping_sub(
            bytes[..bytes.len() - 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b)),
        );
        return Err(ParseError::ChecksumMismatch {
            line,
            expected,
            actual,
        });
    }
    Ok(())
}
