//! The seven DFU class requests and the DfuSe command channel.
//!
//! DfuSe overloads `DFU_DNLOAD` with `wValue = 0` as a command pipe; the
//! commands live in their own enum so a firmware block can never be
//! mistaken for one.

use std::fmt;

use log::trace;

use super::error::DfuError;
use super::state::{DfuState, Status};
use super::transport::{Retry, Transport};

pub(crate) const DFU_DETACH: u8 = 0;
pub(crate) const DFU_DNLOAD: u8 = 1;
pub(crate) const DFU_UPLOAD: u8 = 2;
pub(crate) const DFU_GETSTATUS: u8 = 3;
pub(crate) const DFU_CLRSTATUS: u8 = 4;
pub(crate) const DFU_GETSTATE: u8 = 5;
pub(crate) const DFU_ABORT: u8 = 6;

/// Commands issued over block 0 of `DFU_DNLOAD` on DfuSe devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuseCommand {
    /// Ask the bootloader which commands it supports.
    GetCommands,
    /// Set the address pointer subsequent blocks are written to or read from.
    SetAddress(u32),
    /// Erase the block containing the given address.
    Erase(u32),
    /// Drop flash read protection, mass-erasing the device.
    ReadUnprotect,
}

impl DfuseCommand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::GetCommands => vec![0x00],
            Self::SetAddress(address) => {
                let mut payload = vec![0x21];
                payload.extend_from_slice(&address.to_le_bytes());
                payload
            }
            Self::Erase(address) => {
                let mut payload = vec![0x41];
                payload.extend_from_slice(&address.to_le_bytes());
                payload
            }
            Self::ReadUnprotect => vec![0x92],
        }
    }
}

impl fmt::Display for DfuseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetCommands => f.write_str("get commands"),
            Self::SetAddress(address) => write!(f, "set address {address:#010X}"),
            Self::Erase(address) => write!(f, "erase block at {address:#010X}"),
            Self::ReadUnprotect => f.write_str("read unprotect"),
        }
    }
}

/// The class-request vocabulary, spoken through the retrying transport.
pub(crate) struct Requests<T: Transport> {
    pub transport: Retry<T>,
}

impl<T: Transport> Requests<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Retry::new(transport),
        }
    }

    pub fn detach(&mut self, timeout_ms: u16) -> Result<(), DfuError> {
        trace!("DFU_DETACH wTimeout={timeout_ms}");
        self.transport.control_out(DFU_DETACH, timeout_ms, &[])?;
        Ok(())
    }

    pub fn dnload(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        trace!("DFU_DNLOAD block={block} len={}", data.len());
        self.transport.control_out(DFU_DNLOAD, block, data)?;
        Ok(())
    }

    pub fn upload(&mut self, block: u16, length: usize) -> Result<Vec<u8>, DfuError> {
        trace!("DFU_UPLOAD block={block} len={length}");
        let mut buf = vec![0u8; length];
        let read = self.transport.control_in(DFU_UPLOAD, block, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    pub fn get_status(&mut self) -> Result<Status, DfuError> {
        let mut buf = [0u8; Status::LENGTH];
        let read = self.transport.control_in(DFU_GETSTATUS, 0, &mut buf)?;
        if read != Status::LENGTH {
            return Err(DfuError::Transfer(
                super::transport::TransferError::Short {
                    expected: Status::LENGTH,
                    actual: read,
                },
            ));
        }
        let status = Status::from_bytes(&buf)?;
        trace!(
            "DFU_GETSTATUS -> {} ({}), poll {}ms",
            status.state, status.error, status.poll_timeout_ms
        );
        Ok(status)
    }

    pub fn clr_status(&mut self) -> Result<(), DfuError> {
        trace!("DFU_CLRSTATUS");
        self.transport.control_out(DFU_CLRSTATUS, 0, &[])?;
        Ok(())
    }

    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        let mut buf = [0u8; 1];
        let read = self.transport.control_in(DFU_GETSTATE, 0, &mut buf)?;
        if read != 1 {
            return Err(DfuError::Transfer(
                super::transport::TransferError::Short {
                    expected: 1,
                    actual: read,
                },
            ));
        }
        let state = DfuState::from_raw(buf[0])?;
        trace!("DFU_GETSTATE -> {state}");
        Ok(state)
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        trace!("DFU_ABORT");
        self.transport.control_out(DFU_ABORT, 0, &[])?;
        Ok(())
    }

    pub fn dfuse_command(&mut self, command: DfuseCommand) -> Result<(), DfuError> {
        self.dnload(0, &command.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(DfuseCommand::GetCommands.encode(), vec![0x00]);
        assert_eq!(
            DfuseCommand::SetAddress(0x0800_0000).encode(),
            vec![0x21, 0x00, 0x00, 0x00, 0x08]
        );
        assert_eq!(
            DfuseCommand::Erase(0x0801_C000).encode(),
            vec![0x41, 0x00, 0xC0, 0x01, 0x08]
        );
        assert_eq!(DfuseCommand::ReadUnprotect.encode(), vec![0x92]);
    }
}
