//! Host-side USB Device Firmware Upgrade.
//!
//! Drives DFU 1.1 and DfuSe 1.1a devices through reconfiguration, firmware
//! download, manifestation, and upload, and decodes the firmware image
//! formats that feed them (DFU/DfuSe containers, Intel HEX, Motorola
//! S-record).

pub mod crc32;
pub mod dfu;
pub mod error;
pub mod image;
pub mod layout;
pub mod memory;
pub mod usb;
pub mod wire;

pub use dfu::{
    DfuAttributes, DfuEngine, DfuError, DfuEvents, DfuState, DfuseCommand, ErrorCode,
    FunctionalDescriptor, Identification, NullEvents, Status, Transport, TransferError, Version,
};
pub use error::Error;
pub use image::{
    DfuFile, ParseError, Suffix, TargetImage, parse_dfu_file, parse_intel_hex, parse_srec,
};
pub use layout::{Block, Layout, LayoutError, NamedLayout, Permissions, parse_layout};
pub use memory::{NamedMemory, RawMemory, Segment};
