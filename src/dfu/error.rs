use thiserror::Error;

use super::Version;
use super::state::DfuState;
use super::transport::TransferError;
use crate::layout::LayoutError;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("device is in {actual}, expected {expected}")]
    InvalidState { expected: DfuState, actual: DfuState },

    #[error("control transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("control transfer kept failing after retries: {0}")]
    PersistentTransfer(TransferError),

    #[error("device DFU version {0} is not supported")]
    UnsupportedDfuVersion(Version),

    #[error("file is DFU {file} but device speaks DFU {device}")]
    VersionMismatch { file: Version, device: Version },

    #[error("image {first:#X}..={last:#X} lies outside the device layout {start:#X}..={end:#X}")]
    OutOfRange {
        first: u64,
        last: u64,
        start: u64,
        end: u64,
    },

    #[error("block at {address:#X} is not writeable")]
    ReadOnlyTarget { address: u64 },

    #[error("block at {address:#X} is not readable")]
    NotReadable { address: u64 },

    #[error("block at {address:#X} cannot be erased")]
    EraseNotSupported { address: u64 },

    #[error("device cannot download firmware")]
    DownloadNotSupported,

    #[error("device cannot upload firmware")]
    UploadNotSupported,

    #[error("upload exceeds the addressable block range")]
    UploadTooLarge,

    #[error("unrecognized DFU state code {0:#04X}")]
    UnrecognizedState(u8),

    #[error("malformed {0} descriptor")]
    MalformedDescriptor(&'static str),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("no device matching {vid:04x}:{pid:04x}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("device has no DFU interface")]
    NoDfuInterface,
}

impl DfuError {
    /// True when the failure is a (possibly retried) control-transfer error.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::PersistentTransfer(_))
    }

    /// True when the failure looks like the device left the bus.
    pub fn device_gone(&self) -> bool {
        match self {
            Self::Transfer(e) | Self::PersistentTransfer(e) => e.device_gone(),
            _ => false,
        }
    }
}
