//! The DFU functional descriptor and the device identification tuple.

use bitflags::bitflags;

use super::Version;
use super::error::DfuError;

/// `bLength` of the DFU functional descriptor.
pub const FUNCTIONAL_DESCRIPTOR_LENGTH: usize = 9;

/// `bDescriptorType` of the DFU functional descriptor.
pub const FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

bitflags! {
    /// `bmAttributes` capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DfuAttributes: u8 {
        const CAN_DOWNLOAD = 1 << 0;
        const CAN_UPLOAD = 1 << 1;
        const MANIFESTATION_TOLERANT = 1 << 2;
        const WILL_DETACH = 1 << 3;
    }
}

/// The 9-byte descriptor every DFU interface attaches, advertising its
/// capabilities and timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: DfuAttributes,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
    pub dfu_version: Version,
}

impl FunctionalDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < FUNCTIONAL_DESCRIPTOR_LENGTH
            || bytes[0] as usize != FUNCTIONAL_DESCRIPTOR_LENGTH
            || bytes[1] != FUNCTIONAL_DESCRIPTOR_TYPE
        {
            return Err(DfuError::MalformedDescriptor("functional"));
        }
        Ok(Self {
            attributes: DfuAttributes::from_bits_truncate(bytes[2]),
            detach_timeout_ms: u16::from_le_bytes([bytes[3], bytes[4]]),
            transfer_size: u16::from_le_bytes([bytes[5], bytes[6]]),
            dfu_version: Version::from_bcd(u16::from_le_bytes([bytes[7], bytes[8]])),
        })
    }

    pub fn to_bytes(&self) -> [u8; FUNCTIONAL_DESCRIPTOR_LENGTH] {
        let detach = self.detach_timeout_ms.to_le_bytes();
        let transfer = self.transfer_size.to_le_bytes();
        let version = self.dfu_version.to_bcd().to_le_bytes();
        [
            FUNCTIONAL_DESCRIPTOR_LENGTH as u8,
            FUNCTIONAL_DESCRIPTOR_TYPE,
            self.attributes.bits(),
            detach[0],
            detach[1],
            transfer[0],
            transfer[1],
            version[0],
            version[1],
        ]
    }

    pub fn will_detach(&self) -> bool {
        self.attributes.contains(DfuAttributes::WILL_DETACH)
    }

    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes.contains(DfuAttributes::MANIFESTATION_TOLERANT)
    }
}

/// What the device told us about itself during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`, the firmware revision currently running.
    pub product_version: Version,
    pub dfu_version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::DFUSE_VERSION_1_1A;

    #[test]
    fn test_parse_functional_descriptor() {
        let bytes = [0x09, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x04, 0x1A, 0x01];
        let desc = FunctionalDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(
            desc.attributes,
            DfuAttributes::CAN_DOWNLOAD | DfuAttributes::CAN_UPLOAD | DfuAttributes::WILL_DETACH
        );
        assert_eq!(desc.detach_timeout_ms, 255);
        assert_eq!(desc.transfer_size, 1024);
        assert_eq!(desc.dfu_version, DFUSE_VERSION_1_1A);
        assert!(desc.will_detach());
        assert!(!desc.manifestation_tolerant());
    }

    #[test]
    fn test_roundtrip() {
        let desc = FunctionalDescriptor {
            attributes: DfuAttributes::CAN_DOWNLOAD | DfuAttributes::MANIFESTATION_TOLERANT,
            detach_timeout_ms: 1000,
            transfer_size: 2048,
            dfu_version: Version(1, 0x10),
        };
        assert_eq!(
            FunctionalDescriptor::from_bytes(&desc.to_bytes()).unwrap(),
            desc
        );
    }

    #[test]
    fn test_rejects_wrong_length_or_type() {
        assert!(FunctionalDescriptor::from_bytes(&[0x07, 0x21, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(FunctionalDescriptor::from_bytes(&[0x09, 0x22, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(FunctionalDescriptor::from_bytes(&[0x09, 0x21, 0]).is_err());
    }
}
