//! The USB surface the engine drives, and the retry policy wrapped around it.
//!
//! The engine owns no USB code: it is handed a [`Transport`] at construction
//! and issues class requests through it. The implementation knows its own
//! interface number and request-type bytes; only the DFU semantics live
//! above this trait.

use std::thread;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use super::error::DfuError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer timed out")]
    Timeout,

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },

    #[error("operation not supported by this transport")]
    Unsupported,

    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Errors consistent with the device having left the bus.
    pub fn device_gone(&self) -> bool {
        matches!(self, Self::Stall | Self::Disconnected)
    }

    /// Worth retrying: a stall is a protocol answer and a disconnect is
    /// final, everything else may be a glitch.
    fn transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Short { .. } | Self::Other(_))
    }
}

/// Control-transfer access to one claimed DFU interface.
pub trait Transport {
    /// Class OUT request to the interface. Returns the bytes written.
    fn control_out(&mut self, request: u8, value: u16, data: &[u8])
    -> Result<usize, TransferError>;

    /// Class IN request to the interface. Returns the bytes read.
    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8])
    -> Result<usize, TransferError>;

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransferError>;

    fn get_alt_setting(&mut self) -> Result<u8, TransferError>;

    /// The interface string of the given alternate setting, trailing NULs
    /// trimmed. DfuSe devices publish their memory layout here.
    fn alt_setting_name(&mut self, alt: u8) -> Result<String, TransferError>;

    /// An arbitrary string descriptor, used for vendor error reports.
    fn string_descriptor(&mut self, index: u8) -> Result<String, TransferError>;

    /// Reset the device's USB connection. Transports that cannot do this
    /// return [`TransferError::Unsupported`] so callers can refuse the
    /// operations that need it.
    fn bus_reset(&mut self) -> Result<(), TransferError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

pub(crate) const RETRY_ATTEMPTS: u32 = 10;
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Absorbs transient control-transfer failures so the state machine never
/// sees them: each transfer is attempted up to [`RETRY_ATTEMPTS`] times with
/// a short pause between tries, then reported as persistent.
pub struct Retry<T: Transport> {
    inner: T,
}

impl<T: Transport> Retry<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn attempt<R>(
        &mut self,
        what: &str,
        mut transfer: impl FnMut(&mut T) -> Result<R, TransferError>,
    ) -> Result<R, DfuError> {
        for attempt in 1..RETRY_ATTEMPTS {
            match transfer(&mut self.inner) {
                Ok(value) => return Ok(value),
                Err(error) if error.transient() => {
                    debug!("{what} failed on attempt {attempt}: {error}, retrying");
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(error) => return Err(DfuError::Transfer(error)),
            }
        }
        match transfer(&mut self.inner) {
            Ok(value) => Ok(value),
            Err(error) if error.transient() => Err(DfuError::PersistentTransfer(error)),
            Err(error) => Err(DfuError::Transfer(error)),
        }
    }

    pub fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        self.attempt("control OUT", |t| t.control_out(request, value, data))
    }

    pub fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
    ) -> Result<usize, DfuError> {
        self.attempt("control IN", |t| t.control_in(request, value, buf))
    }

    pub fn set_alt_setting(&mut self, alt: u8) -> Result<(), DfuError> {
        self.inner.set_alt_setting(alt).map_err(DfuError::Transfer)
    }

    pub fn get_alt_setting(&mut self) -> Result<u8, DfuError> {
        self.inner.get_alt_setting().map_err(DfuError::Transfer)
    }

    pub fn alt_setting_name(&mut self, alt: u8) -> Result<String, DfuError> {
        self.inner.alt_setting_name(alt).map_err(DfuError::Transfer)
    }

    pub fn string_descriptor(&mut self, index: u8) -> Result<String, DfuError> {
        self.inner
            .string_descriptor(index)
            .map_err(DfuError::Transfer)
    }

    pub fn bus_reset(&mut self) -> Result<(), DfuError> {
        self.inner.bus_reset().map_err(DfuError::Transfer)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
