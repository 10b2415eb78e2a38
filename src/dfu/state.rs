//! DFU device states and status reports.

use std::fmt;

use super::error::DfuError;

/// The eleven states of the DFU 1.1 state machine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    Idle = 2,
    DnloadSync = 3,
    DnloadBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

impl DfuState {
    pub fn from_raw(raw: u8) -> Result<Self, DfuError> {
        Ok(match raw {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::Idle,
            3 => Self::DnloadSync,
            4 => Self::DnloadBusy,
            5 => Self::DnloadIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::Error,
            other => return Err(DfuError::UnrecognizedState(other)),
        })
    }

    /// True for the two run-time states, before the device re-enumerates
    /// into DFU mode.
    pub fn is_app_state(self) -> bool {
        self < Self::Idle
    }

    /// States that DFU_ABORT returns to [`DfuState::Idle`].
    pub fn abortable(self) -> bool {
        matches!(
            self,
            Self::DnloadSync | Self::DnloadIdle | Self::ManifestSync | Self::UploadIdle
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AppIdle => "appIDLE",
            Self::AppDetach => "appDETACH",
            Self::Idle => "dfuIDLE",
            Self::DnloadSync => "dfuDNLOAD-SYNC",
            Self::DnloadBusy => "dfuDNBUSY",
            Self::DnloadIdle => "dfuDNLOAD-IDLE",
            Self::ManifestSync => "dfuMANIFEST-SYNC",
            Self::Manifest => "dfuMANIFEST",
            Self::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            Self::UploadIdle => "dfuUPLOAD-IDLE",
            Self::Error => "dfuERROR",
        })
    }
}

/// Status codes from DFU 1.1 table 4.2. Codes past `ErrStalledPkt` are kept
/// verbatim so they round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbr,
    ErrPor,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl ErrorCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbr,
            0x0D => Self::ErrPor,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPkt,
            other => Self::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::ErrTarget => 0x01,
            Self::ErrFile => 0x02,
            Self::ErrWrite => 0x03,
            Self::ErrErase => 0x04,
            Self::ErrCheckErased => 0x05,
            Self::ErrProg => 0x06,
            Self::ErrVerify => 0x07,
            Self::ErrAddress => 0x08,
            Self::ErrNotDone => 0x09,
            Self::ErrFirmware => 0x0A,
            Self::ErrVendor => 0x0B,
            Self::ErrUsbr => 0x0C,
            Self::ErrPor => 0x0D,
            Self::ErrUnknown => 0x0E,
            Self::ErrStalledPkt => 0x0F,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("no error"),
            Self::ErrTarget => f.write_str("file is not targeted for use by this device"),
            Self::ErrFile => f.write_str("file fails a vendor-specific verification test"),
            Self::ErrWrite => f.write_str("device is unable to write memory"),
            Self::ErrErase => f.write_str("memory erase function failed"),
            Self::ErrCheckErased => f.write_str("memory erase check failed"),
            Self::ErrProg => f.write_str("program memory function failed"),
            Self::ErrVerify => f.write_str("programmed memory failed verification"),
            Self::ErrAddress => f.write_str("received address is out of range"),
            Self::ErrNotDone => {
                f.write_str("received a final block but the device expects more data")
            }
            Self::ErrFirmware => f.write_str("device firmware is corrupt"),
            Self::ErrVendor => f.write_str("vendor-specific error"),
            Self::ErrUsbr => f.write_str("device detected an unexpected USB reset"),
            Self::ErrPor => f.write_str("device detected an unexpected power-on reset"),
            Self::ErrUnknown => f.write_str("device failed for an unknown reason"),
            Self::ErrStalledPkt => f.write_str("device stalled an unexpected request"),
            Self::Unknown(raw) => write!(f, "unrecognized status code {raw:#04X}"),
        }
    }
}

/// A decoded DFU_GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub error: ErrorCode,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    pub i_string: u8,
}

impl Status {
    /// Wire size of a GETSTATUS response.
    pub const LENGTH: usize = 6;

    pub fn from_bytes(bytes: &[u8; Self::LENGTH]) -> Result<Self, DfuError> {
        Ok(Self {
            error: ErrorCode::from_raw(bytes[0]),
            poll_timeout_ms: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]),
            state: DfuState::from_raw(bytes[4])?,
            i_string: bytes[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let poll = self.poll_timeout_ms.to_le_bytes();
        [
            self.error.to_raw(),
            poll[0],
            poll[1],
            poll[2],
            self.state as u8,
            self.i_string,
        ]
    }
}
