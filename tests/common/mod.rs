//! A scripted DFU device for driving the engine without hardware.

#![allow(dead_code)]

use udfu::dfu::{DFU_VERSION_1_1, DFUSE_VERSION_1_1A};
use udfu::{
    DfuAttributes, DfuEvents, DfuState, ErrorCode, FunctionalDescriptor, Identification, Status,
    TransferError, Transport, Version,
};

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

/// Mock transport that models the device side of the DFU state machine and
/// records every request it sees.
pub struct MockTransport {
    pub state: DfuState,
    pub error: ErrorCode,
    pub i_string: u8,
    pub poll_timeout_ms: u32,
    /// Treat DNLOAD block 0 as the DfuSe command channel.
    pub dfuse: bool,
    /// DnloadBusy statuses reported after each write before DnloadIdle.
    pub busy_polls: u32,
    /// Manifest statuses reported after the terminating ZLP.
    pub manifest_polls: u32,
    pub manifest_terminal: DfuState,
    /// The device drops off the bus once manifestation starts.
    pub vanish_in_manifest: bool,
    /// DETACH stalls and the device drops off the bus.
    pub vanish_on_detach: bool,
    /// Writing this block flips the device into dfuERROR.
    pub fail_block: Option<u16>,
    pub fail_error: ErrorCode,
    /// Writing this block fails at the transport level, repeatedly.
    pub reject_block: Option<u16>,
    pub vendor_string: Option<(u8, String)>,
    pub upload_data: Vec<u8>,
    pub upload_first_block: u16,
    pub transfer_size: usize,
    /// Interface strings per alternate setting.
    pub alt_strings: Vec<String>,

    // wire-level records
    pub log: Vec<String>,
    pub written: Vec<(u16, Vec<u8>)>,
    pub set_addresses: Vec<u32>,
    pub erased: Vec<u32>,
    pub alt_selected: Vec<u8>,
    pub bus_resets: u32,
    pub detaches: Vec<u16>,

    current_alt: u8,
    busy_left: u32,
    manifest_left: u32,
    manifesting: bool,
    error_pending: bool,
    open: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: DfuState::Idle,
            error: ErrorCode::Ok,
            i_string: 0,
            poll_timeout_ms: 0,
            dfuse: false,
            busy_polls: 0,
            manifest_polls: 0,
            manifest_terminal: DfuState::Idle,
            vanish_in_manifest: false,
            vanish_on_detach: false,
            fail_block: None,
            fail_error: ErrorCode::ErrWrite,
            reject_block: None,
            vendor_string: None,
            upload_data: Vec::new(),
            upload_first_block: 0,
            transfer_size: 0,
            alt_strings: Vec::new(),
            log: Vec::new(),
            written: Vec::new(),
            set_addresses: Vec::new(),
            erased: Vec::new(),
            alt_selected: Vec::new(),
            bus_resets: 0,
            detaches: Vec::new(),
            current_alt: 0,
            busy_left: 0,
            manifest_left: 0,
            manifesting: false,
            error_pending: false,
            open: true,
        }
    }

    fn status(&self, state: DfuState) -> Status {
        Status {
            error: self.error,
            poll_timeout_ms: self.poll_timeout_ms,
            state,
            i_string: self.i_string,
        }
    }

    fn status_response(&mut self) -> Result<Status, TransferError> {
        if self.manifesting {
            if self.vanish_in_manifest {
                self.open = false;
                return Err(TransferError::Disconnected);
            }
            if self.manifest_left > 0 {
                self.manifest_left -= 1;
                self.state = DfuState::Manifest;
            } else {
                self.state = self.manifest_terminal;
                self.manifesting = false;
            }
            return Ok(self.status(self.state));
        }
        if self.busy_left > 0 {
            self.busy_left -= 1;
            return Ok(self.status(DfuState::DnloadBusy));
        }
        if self.error_pending {
            self.error_pending = false;
            self.state = DfuState::Error;
            return Ok(self.status(DfuState::Error));
        }
        if self.state == DfuState::DnloadSync {
            self.state = DfuState::DnloadIdle;
        }
        Ok(self.status(self.state))
    }
}

impl Transport for MockTransport {
    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<usize, TransferError> {
        if !self.open {
            return Err(TransferError::Disconnected);
        }
        match request {
            DFU_DETACH => {
                self.log.push(format!("DETACH:{value}"));
                self.detaches.push(value);
                if self.vanish_on_detach {
                    self.open = false;
                    return Err(TransferError::Stall);
                }
                self.state = DfuState::AppDetach;
                Ok(0)
            }
            DFU_DNLOAD => {
                if data.is_empty() {
                    self.log.push("DNLOAD:ZLP".to_string());
                    self.manifesting = true;
                    self.manifest_left = self.manifest_polls;
                    self.state = DfuState::ManifestSync;
                    return Ok(0);
                }
                self.log.push(format!("DNLOAD:{value}:{}", data.len()));
                if !matches!(self.state, DfuState::Idle | DfuState::DnloadIdle) {
                    self.error = ErrorCode::ErrStalledPkt;
                    self.state = DfuState::Error;
                    return Err(TransferError::Stall);
                }
                if self.reject_block == Some(value) {
                    return Err(TransferError::Other("write rejected".to_string()));
                }
                if self.dfuse && value == 0 {
                    match data {
                        [0x21, rest @ ..] if rest.len() == 4 => self
                            .set_addresses
                            .push(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]])),
                        [0x41, rest @ ..] if rest.len() == 4 => self
                            .erased
                            .push(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]])),
                        _ => {}
                    }
                } else {
                    if self.fail_block == Some(value) {
                        self.error_pending = true;
                        self.error = self.fail_error;
                    }
                    self.written.push((value, data.to_vec()));
                }
                self.state = DfuState::DnloadSync;
                self.busy_left = self.busy_polls;
                Ok(data.len())
            }
            DFU_CLRSTATUS => {
                self.log.push("CLRSTATUS".to_string());
                self.error = ErrorCode::Ok;
                self.state = DfuState::Idle;
                Ok(0)
            }
            DFU_ABORT => {
                self.log.push("ABORT".to_string());
                self.state = DfuState::Idle;
                Ok(0)
            }
            other => Err(TransferError::Other(format!("unexpected OUT request {other}"))),
        }
    }

    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize, TransferError> {
        if !self.open {
            return Err(TransferError::Disconnected);
        }
        match request {
            DFU_GETSTATUS => {
                let status = self.status_response()?;
                self.log.push(format!("STATUS:{}", status.state));
                let bytes = status.to_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            DFU_GETSTATE => {
                self.log.push("GETSTATE".to_string());
                if buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.state as u8;
                Ok(1)
            }
            DFU_UPLOAD => {
                self.log.push(format!("UPLOAD:{value}:{}", buf.len()));
                if buf.is_empty() {
                    self.state = DfuState::Idle;
                    return Ok(0);
                }
                if !matches!(self.state, DfuState::Idle | DfuState::UploadIdle) {
                    return Err(TransferError::Stall);
                }
                let offset =
                    value.saturating_sub(self.upload_first_block) as usize * self.transfer_size;
                let available = self.upload_data.len().saturating_sub(offset);
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&self.upload_data[offset..offset + n]);
                self.state = if n == buf.len() {
                    DfuState::UploadIdle
                } else {
                    DfuState::Idle
                };
                Ok(n)
            }
            other => Err(TransferError::Other(format!("unexpected IN request {other}"))),
        }
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransferError> {
        self.log.push(format!("SET_ALT:{alt}"));
        self.alt_selected.push(alt);
        self.current_alt = alt;
        Ok(())
    }

    fn get_alt_setting(&mut self) -> Result<u8, TransferError> {
        Ok(self.current_alt)
    }

    fn alt_setting_name(&mut self, alt: u8) -> Result<String, TransferError> {
        self.alt_strings
            .get(alt as usize)
            .cloned()
            .ok_or(TransferError::Unsupported)
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransferError> {
        match &self.vendor_string {
            Some((i, text)) if *i == index => Ok(text.clone()),
            _ => Err(TransferError::Unsupported),
        }
    }

    fn bus_reset(&mut self) -> Result<(), TransferError> {
        self.log.push("RESET".to_string());
        if !self.open {
            return Err(TransferError::Disconnected);
        }
        self.bus_resets += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Event sink that records everything it is told.
#[derive(Default)]
pub struct RecordedEvents {
    pub progress: Vec<(u8, usize)>,
    pub errors: Vec<String>,
}

impl DfuEvents for RecordedEvents {
    fn progress(&mut self, percent: u8, transferred: usize) {
        self.progress.push((percent, transferred));
    }

    fn device_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

pub fn descriptor(
    attributes: DfuAttributes,
    transfer_size: u16,
    dfuse: bool,
) -> FunctionalDescriptor {
    FunctionalDescriptor {
        attributes,
        detach_timeout_ms: 0,
        transfer_size,
        dfu_version: if dfuse {
            DFUSE_VERSION_1_1A
        } else {
            DFU_VERSION_1_1
        },
    }
}

pub fn identification(dfuse: bool) -> Identification {
    Identification {
        vendor_id: 0x0483,
        product_id: 0xDF11,
        product_version: Version(0x02, 0x21),
        dfu_version: if dfuse {
            DFUSE_VERSION_1_1A
        } else {
            DFU_VERSION_1_1
        },
    }
}
