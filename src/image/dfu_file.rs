//! DFU suffix and DfuSe container decoding.
//!
//! Every DFU file ends in a 16-byte suffix whose CRC covers the rest of the
//! file. Plain 1.1 files carry one opaque firmware payload; DfuSe 1.1a files
//! wrap a prefix/target/element tree that maps alternate settings to named,
//! address-annotated images.

use super::ParseError;
use crate::crc32::crc32;
use crate::memory::{NamedMemory, RawMemory, Segment};
use crate::wire::Reader;

/// Length of the trailing suffix in bytes.
pub const SUFFIX_LENGTH: usize = 16;

/// `bcdDFU` of a standard DFU 1.1 file.
pub const PLAIN_DFU_VERSION: u16 = 0x0100;

/// `bcdDFU` of a DfuSe 1.1a file.
pub const DFUSE_DFU_VERSION: u16 = 0x011A;

/// Placeholder start address for plain files, which carry none.
pub const RAW_IMAGE_ADDRESS: u64 = 0xFFFF_FFFF;

const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const TARGET_NAME_LENGTH: usize = 255;

/// The 16-byte DFU file suffix.
///
/// `vendor_id`, `product_id`, and `device_version` are 0xFFFF when the file
/// does not constrain them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suffix {
    pub device_version: u16,
    pub product_id: u16,
    pub vendor_id: u16,
    pub dfu_version: u16,
    pub length: u8,
    pub crc: u32,
}

impl Suffix {
    /// Decode the suffix from the last [`SUFFIX_LENGTH`] bytes of a file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(bytes);
        let device_version = r.u16()?;
        let product_id = r.u16()?;
        let vendor_id = r.u16()?;
        let dfu_version = r.u16()?;
        let signature = r.bytes(3)?;
        let length = r.u8()?;
        let crc = r.u32()?;

        if signature != SUFFIX_SIGNATURE {
            return Err(ParseError::BadFormat("missing DFU suffix signature".to_string()));
        }
        if (length as usize) < SUFFIX_LENGTH {
            return Err(ParseError::BadFormat(format!(
                "suffix length {length} shorter than the suffix itself"
            )));
        }

        Ok(Self {
            device_version,
            product_id,
            vendor_id,
            dfu_version,
            length,
            crc,
        })
    }

    pub fn to_bytes(&self) -> [u8; SUFFIX_LENGTH] {
        let mut bytes = [0u8; SUFFIX_LENGTH];
        bytes[0..2].copy_from_slice(&self.device_version.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.product_id.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.vendor_id.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.dfu_version.to_le_bytes());
        bytes[8..11].copy_from_slice(SUFFIX_SIGNATURE);
        bytes[11] = self.length;
        bytes[12..16].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_DFU_VERSION
    }
}

/// One firmware image bound to the alternate setting it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetImage {
    pub alt_setting: u8,
    pub image: NamedMemory,
}

/// A decoded DFU file: its targets in declaration order, plus the suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuFile {
    pub targets: Vec<TargetImage>,
    pub suffix: Suffix,
}

/// Decode a `.dfu` file.
///
/// The suffix CRC is verified first; the payload is then decoded as a DfuSe
/// container when `bcdDFU` says 1.1a, otherwise as a single raw image at
/// alternate setting 0 with the [`RAW_IMAGE_ADDRESS`] placeholder.
pub fn parse_dfu_file(data: &[u8]) -> Result<DfuFile, ParseError> {
    if data.len() < SUFFIX_LENGTH {
        return Err(ParseError::BadFormat(
            "file shorter than the DFU suffix".to_string(),
        ));
    }
    let suffix = Suffix::from_bytes(&data[data.len() - SUFFIX_LENGTH..])?;

    let computed = crc32(&data[..data.len() - 4]);
    if computed != suffix.crc {
        return Err(ParseError::BadCrc {
            computed,
            stored: suffix.crc,
        });
    }

    let length = suffix.length as usize;
    if length > data.len() {
        return Err(ParseError::BadFormat(
            "suffix length exceeds the file".to_string(),
        ));
    }
    let content = &data[..data.len() - length];

    let targets = if suffix.is_dfuse() {
        parse_dfuse(content)?
    } else {
        if content.is_empty() {
            return Err(ParseError::BadFormat("empty firmware payload".to_string()));
        }
        let mut memory = RawMemory::new();
        memory.try_add(Segment::new(RAW_IMAGE_ADDRESS, content.to_vec()));
        vec![TargetImage {
            alt_setting: 0,
            image: NamedMemory::new("", memory),
        }]
    };

    Ok(DfuFile { targets, suffix })
}

fn parse_dfuse(content: &[u8]) -> Result<Vec<TargetImage>, ParseError> {
    let mut r = Reader::new(content);

    if r.bytes(5)? != DFUSE_SIGNATURE {
        return Err(ParseError::BadFormat(
            "missing DfuSe prefix signature".to_string(),
        ));
    }
    let version = r.u8()?;
    if version != 1 {
        return Err(ParseError::BadFormat(format!(
            "unsupported DfuSe prefix version {version}"
        )));
    }
    let image_size = r.u32()? as usize;
    if image_size != content.len() {
        return Err(ParseError::BadFormat(format!(
            "container says {image_size} bytes, file holds {}",
            content.len()
        )));
    }
    let target_count = r.u8()?;

    let mut targets = Vec::with_capacity(target_count as usize);
    for _ in 0..target_count {
        targets.push(parse_target(&mut r)?);
    }

    if !r.is_empty() {
        return Err(ParseError::BadFormat(
            "trailing data between targets and suffix".to_string(),
        ));
    }

    Ok(targets)
}

fn parse_target(r: &mut Reader<'_>) -> Result<TargetImage, ParseError> {
    if r.bytes(6)? != TARGET_SIGNATURE {
        return Err(ParseError::BadFormat(
            "missing Target prefix signature".to_string(),
        ));
    }
    let alt_setting = r.u8()?;
    let named = r.u32()?;
    let name_bytes = r.bytes(TARGET_NAME_LENGTH)?;
    let target_size = r.u32()? as usize;
    let element_count = r.u32()?;

    let name = if named != 0 {
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TARGET_NAME_LENGTH);
        String::from_utf8_lossy(&name_bytes[..end]).to_string()
    } else {
        String::new()
    };

    let mut memory = RawMemory::new();
    let mut consumed = 0usize;
    for _ in 0..element_count {
        let address = r.u32()? as u64;
        let size = r.u32()? as usize;
        let payload = r.bytes(size)?;
        consumed += 8 + size;
        if size > 0 && !memory.try_add(Segment::new(address, payload.to_vec())) {
            return Err(ParseError::Overlap { address });
        }
    }

    if consumed != target_size {
        return Err(ParseError::BadFormat(format!(
            "target says {target_size} bytes, elements hold {consumed}"
        )));
    }

    Ok(TargetImage {
        alt_setting,
        image: NamedMemory::new(name, memory),
    })
}
