//! The DFU state machine.
//!
//! One engine drives one device from open to close: reconfiguration out of
//! the running application, firmware download (plain 1.1 or DfuSe),
//! manifestation, and upload. All waiting is explicit: the engine sleeps
//! exactly as long as the device's last `bwPollTimeout` told it to, and all
//! class requests against the device are strictly serialized.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::descriptor::{DfuAttributes, FunctionalDescriptor, Identification};
use super::error::DfuError;
use super::request::{DfuseCommand, Requests};
use super::state::{DfuState, ErrorCode, Status};
use super::transport::Transport;
use super::{DFU_VERSION_1_1, DFUSE_VERSION_1_1A, Version};
use crate::image::{DfuFile, TargetImage};
use crate::layout::{NamedLayout, Permissions, parse_layout};

/// Settling time after a detach, on top of the device's own timeout, to
/// amortize OS re-enumeration and driver mount.
const REENUMERATION_GRACE: Duration = Duration::from_millis(500);

/// First firmware block number after a DfuSe command; blocks 0 and 1 address
/// the command channel.
const DFUSE_FIRST_BLOCK: u16 = 2;

/// Synchronous notifications delivered on the calling thread.
pub trait DfuEvents {
    /// Download progress: whole percent and bytes transferred so far.
    fn progress(&mut self, _percent: u8, _transferred: usize) {}

    /// The device reported an error state; `message` is the vendor string
    /// when one is available, the DFU status text otherwise.
    fn device_error(&mut self, _message: &str) {}
}

/// Event sink that drops everything.
pub struct NullEvents;

impl DfuEvents for NullEvents {}

pub struct DfuEngine<T: Transport> {
    requests: Requests<T>,
    descriptor: FunctionalDescriptor,
    identification: Identification,
    /// Cached alternate setting; assigning the current value again must not
    /// generate USB traffic.
    alt_setting: Option<u8>,
}

impl<T: Transport> DfuEngine<T> {
    /// Wrap an opened DFU interface.
    ///
    /// Rejects devices that speak neither DFU 1.1 nor DfuSe 1.1a, and
    /// descriptors that advertise a zero transfer size.
    pub fn new(
        transport: T,
        descriptor: FunctionalDescriptor,
        identification: Identification,
    ) -> Result<Self, DfuError> {
        if descriptor.dfu_version != DFU_VERSION_1_1 && descriptor.dfu_version != DFUSE_VERSION_1_1A
        {
            return Err(DfuError::UnsupportedDfuVersion(descriptor.dfu_version));
        }
        if descriptor.transfer_size == 0 {
            return Err(DfuError::MalformedDescriptor("functional"));
        }
        Ok(Self {
            requests: Requests::new(transport),
            descriptor,
            identification,
            alt_setting: None,
        })
    }

    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    pub fn identification(&self) -> &Identification {
        &self.identification
    }

    pub fn is_dfuse(&self) -> bool {
        self.descriptor.dfu_version == DFUSE_VERSION_1_1A
    }

    pub fn transport(&self) -> &T {
        self.requests.transport.get_ref()
    }

    pub fn into_transport(self) -> T {
        self.requests.transport.into_inner()
    }

    /// The device's current state, via DFU_GETSTATE.
    pub fn state(&mut self) -> Result<DfuState, DfuError> {
        self.requests.get_state()
    }

    /// Verify a DFU file targets the protocol family this device speaks.
    pub fn check_file(&self, file: &DfuFile) -> Result<(), DfuError> {
        if file.suffix.is_dfuse() != self.is_dfuse() {
            return Err(DfuError::VersionMismatch {
                file: Version::from_bcd(file.suffix.dfu_version),
                device: self.descriptor.dfu_version,
            });
        }
        Ok(())
    }

    /// Drive an application-mode device into its DFU configuration.
    ///
    /// The handle is closed afterwards; the caller re-opens the device once
    /// it has re-enumerated.
    pub fn reconfigure(&mut self) -> Result<(), DfuError> {
        let status = self.requests.get_status()?;
        if !status.state.is_app_state() {
            return Err(DfuError::InvalidState {
                expected: DfuState::AppIdle,
                actual: status.state,
            });
        }

        let will_detach = self.descriptor.will_detach();
        if status.state == DfuState::AppIdle {
            info!("detaching, timeout {}ms", self.descriptor.detach_timeout_ms);
            match self.requests.detach(self.descriptor.detach_timeout_ms) {
                Err(error) if will_detach && error.device_gone() => {
                    debug!("detach dropped the device early: {error}");
                }
                other => other?,
            }
        }

        if !will_detach {
            // the device waits for a reset; it may vanish mid-request
            if let Err(error) = self.requests.transport.bus_reset() {
                debug!("bus reset after detach failed: {error}");
            }
        }
        self.requests.transport.close();

        let settle =
            Duration::from_millis(self.descriptor.detach_timeout_ms as u64) + REENUMERATION_GRACE;
        info!("waiting {}ms for re-enumeration", settle.as_millis());
        thread::sleep(settle);
        Ok(())
    }

    /// Clear any error, abort any session, and leave the device in dfuIDLE.
    pub fn reset_to_idle(&mut self, events: &mut dyn DfuEvents) -> Result<(), DfuError> {
        let mut status = self.requests.get_status()?;

        if status.state == DfuState::Error {
            let message = self.status_message(&status);
            warn!("device reports: {message}");
            events.device_error(&message);
            self.requests.clr_status()?;
            status = self.requests.get_status()?;
        }

        if status.state.abortable() {
            self.requests.abort()?;
            status = self.requests.get_status()?;
        }

        if status.state != DfuState::Idle {
            return Err(DfuError::InvalidState {
                expected: DfuState::Idle,
                actual: status.state,
            });
        }
        Ok(())
    }

    /// DFU 1.1 download of a single contiguous image.
    ///
    /// Manifestation is separate; call [`DfuEngine::manifest`] afterwards.
    pub fn download(&mut self, data: &[u8], events: &mut dyn DfuEvents) -> Result<(), DfuError> {
        if !self.descriptor.attributes.contains(DfuAttributes::CAN_DOWNLOAD) {
            return Err(DfuError::DownloadNotSupported);
        }
        self.reset_to_idle(events)?;
        info!("downloading {} bytes", data.len());

        let result: Result<(), DfuError> = (|| {
            let transfer_size = self.descriptor.transfer_size as usize;
            let total = data.len();
            let mut block: u16 = 0;
            let mut transferred = 0usize;
            while transferred < total {
                let chunk = (total - transferred).min(transfer_size);
                self.requests
                    .dnload(block, &data[transferred..transferred + chunk])?;
                self.expect_dnload_idle(events)?;
                block = block.wrapping_add(1);
                transferred += chunk;
                emit_progress(events, transferred, total);
            }
            Ok(())
        })();
        self.recover_on_failure(result)
    }

    /// DfuSe download: every target of the file, in its declared order.
    pub fn download_dfuse(
        &mut self,
        targets: &[TargetImage],
        events: &mut dyn DfuEvents,
    ) -> Result<(), DfuError> {
        if !self.is_dfuse() {
            return Err(DfuError::UnsupportedDfuVersion(self.descriptor.dfu_version));
        }
        if !self.descriptor.attributes.contains(DfuAttributes::CAN_DOWNLOAD) {
            return Err(DfuError::DownloadNotSupported);
        }
        for target in targets {
            let result = self.download_dfuse_target(target, events);
            self.recover_on_failure(result)?;
        }
        Ok(())
    }

    fn download_dfuse_target(
        &mut self,
        target: &TargetImage,
        events: &mut dyn DfuEvents,
    ) -> Result<(), DfuError> {
        self.select_alt_setting(target.alt_setting)?;
        let named = self.read_layout(target.alt_setting)?;
        let layout = &named.layout;

        let image = &target.image.memory;
        let (Some(first), Some(last)) = (image.first_segment(), image.last_segment()) else {
            debug!("target \"{}\" carries no data, skipping", target.image.name);
            return Ok(());
        };
        let (first_addr, last_addr) = (first.start_address, last.end_address());
        if !layout.covers(first_addr, last_addr) {
            return Err(DfuError::OutOfRange {
                first: first_addr,
                last: last_addr,
                start: layout.start_address().unwrap_or(0),
                end: layout.end_address().unwrap_or(0),
            });
        }

        self.reset_to_idle(events)?;
        info!(
            "writing {} bytes to \"{}\" (alt {})",
            image.total_bytes(),
            named.name,
            target.alt_setting
        );

        for block in layout.blocks_covering(first_addr, last_addr) {
            if !block.permissions.contains(Permissions::WRITEABLE) {
                return Err(DfuError::ReadOnlyTarget {
                    address: block.start_address,
                });
            }
            if block.permissions.contains(Permissions::ERASEABLE) {
                self.dfuse_command(DfuseCommand::Erase(block.start_address as u32), events)?;
            }
        }

        let transfer_size = self.descriptor.transfer_size as usize;
        let total = image.total_bytes();
        let mut transferred = 0usize;
        for segment in image.segments() {
            self.dfuse_command(
                DfuseCommand::SetAddress(segment.start_address as u32),
                events,
            )?;
            let mut block = DFUSE_FIRST_BLOCK;
            let mut offset = 0usize;
            while offset < segment.len() {
                let chunk = (segment.len() - offset).min(transfer_size);
                self.requests
                    .dnload(block, &segment.data[offset..offset + chunk])?;
                self.expect_dnload_idle(events)?;
                offset += chunk;
                transferred += chunk;
                block = block.wrapping_add(1);
                if block == 0 {
                    // block numbers exhausted; rebase past the command channel
                    self.dfuse_command(
                        DfuseCommand::SetAddress((segment.start_address + offset as u64) as u32),
                        events,
                    )?;
                    block = DFUSE_FIRST_BLOCK;
                }
                emit_progress(events, transferred, total);
            }
        }
        Ok(())
    }

    /// Erase every block of `alt` touching the inclusive address range.
    pub fn erase(
        &mut self,
        alt: u8,
        first: u64,
        last: u64,
        events: &mut dyn DfuEvents,
    ) -> Result<(), DfuError> {
        if !self.is_dfuse() {
            return Err(DfuError::UnsupportedDfuVersion(self.descriptor.dfu_version));
        }
        self.select_alt_setting(alt)?;
        let named = self.read_layout(alt)?;
        if !named.layout.covers(first, last) {
            return Err(DfuError::OutOfRange {
                first,
                last,
                start: named.layout.start_address().unwrap_or(0),
                end: named.layout.end_address().unwrap_or(0),
            });
        }
        self.reset_to_idle(events)?;
        for block in named.layout.blocks_covering(first, last) {
            if !block.permissions.contains(Permissions::ERASEABLE) {
                return Err(DfuError::EraseNotSupported {
                    address: block.start_address,
                });
            }
            self.dfuse_command(DfuseCommand::Erase(block.start_address as u32), events)?;
        }
        Ok(())
    }

    /// End the transfer phase and see the device through manifestation.
    ///
    /// Closes the handle; manifestation re-enumerates the device one way or
    /// another.
    pub fn manifest(&mut self) -> Result<(), DfuError> {
        let tolerant = self.descriptor.manifestation_tolerant();
        let will_detach = self.descriptor.will_detach();

        let result = self.manifest_sequence(tolerant, will_detach);
        self.requests.transport.close();

        match result {
            Err(error) if !tolerant && will_detach && error.is_transfer() => {
                // the device tears down its own USB stack at this point
                debug!("transfer error during manifestation tolerated: {error}");
                Ok(())
            }
            other => other,
        }
    }

    fn manifest_sequence(&mut self, tolerant: bool, will_detach: bool) -> Result<(), DfuError> {
        info!("manifesting");
        self.requests.dnload(0, &[])?;

        let mut status = self.requests.get_status()?;
        while status.state == DfuState::Manifest {
            self.sleep_poll(&status);
            status = self.requests.get_status()?;
        }

        if tolerant {
            if status.state != DfuState::Idle {
                return Err(DfuError::InvalidState {
                    expected: DfuState::Idle,
                    actual: status.state,
                });
            }
            self.requests.transport.bus_reset()?;
        } else {
            if status.state != DfuState::ManifestWaitReset {
                return Err(DfuError::InvalidState {
                    expected: DfuState::ManifestWaitReset,
                    actual: status.state,
                });
            }
            if !will_detach {
                self.requests.transport.bus_reset()?;
            }
        }
        Ok(())
    }

    /// DFU 1.1 upload, reading until the device sends a short transfer or
    /// `limit` bytes have arrived.
    pub fn upload(
        &mut self,
        limit: Option<usize>,
        events: &mut dyn DfuEvents,
    ) -> Result<Vec<u8>, DfuError> {
        if !self.descriptor.attributes.contains(DfuAttributes::CAN_UPLOAD) {
            return Err(DfuError::UploadNotSupported);
        }
        self.reset_to_idle(events)?;
        self.upload_blocks(0, limit)
    }

    /// DfuSe upload of `length` bytes starting at `address`.
    pub fn upload_dfuse(
        &mut self,
        alt: u8,
        address: u32,
        length: usize,
        events: &mut dyn DfuEvents,
    ) -> Result<Vec<u8>, DfuError> {
        if !self.is_dfuse() {
            return Err(DfuError::UnsupportedDfuVersion(self.descriptor.dfu_version));
        }
        if !self.descriptor.attributes.contains(DfuAttributes::CAN_UPLOAD) {
            return Err(DfuError::UploadNotSupported);
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        self.select_alt_setting(alt)?;
        let named = self.read_layout(alt)?;
        let (first, last) = (address as u64, address as u64 + length as u64 - 1);
        if !named.layout.covers(first, last) {
            return Err(DfuError::OutOfRange {
                first,
                last,
                start: named.layout.start_address().unwrap_or(0),
                end: named.layout.end_address().unwrap_or(0),
            });
        }
        for block in named.layout.blocks_covering(first, last) {
            if !block.permissions.contains(Permissions::READABLE) {
                return Err(DfuError::NotReadable {
                    address: block.start_address,
                });
            }
        }

        self.reset_to_idle(events)?;
        self.dfuse_command(DfuseCommand::SetAddress(address), events)?;
        // leave dfuDNLOAD-IDLE, upload is only legal from dfuIDLE
        self.requests.abort()?;
        let status = self.requests.get_status()?;
        if status.state != DfuState::Idle {
            return Err(DfuError::InvalidState {
                expected: DfuState::Idle,
                actual: status.state,
            });
        }

        self.upload_blocks(DFUSE_FIRST_BLOCK, Some(length))
    }

    fn upload_blocks(&mut self, first_block: u16, limit: Option<usize>) -> Result<Vec<u8>, DfuError> {
        let transfer_size = self.descriptor.transfer_size as usize;
        let mut out = Vec::new();
        let mut block = first_block;
        let mut last_read = 0usize;

        loop {
            let want = limit.map_or(transfer_size, |l| (l - out.len()).min(transfer_size));
            if want == 0 {
                break;
            }
            let data = self.requests.upload(block, want)?;
            last_read = data.len();
            out.extend_from_slice(&data);
            if last_read < want {
                break;
            }
            block = block.checked_add(1).ok_or(DfuError::UploadTooLarge)?;
        }

        if last_read == transfer_size {
            // device still expects more reads; a zero-length one ends the session
            self.requests.upload(block, 0)?;
        }
        debug!("uploaded {} bytes", out.len());
        Ok(out)
    }

    fn select_alt_setting(&mut self, alt: u8) -> Result<(), DfuError> {
        if self.alt_setting == Some(alt) {
            return Ok(());
        }
        if self.alt_setting.is_none() {
            match self.requests.transport.get_alt_setting() {
                Ok(current) => {
                    self.alt_setting = Some(current);
                    if current == alt {
                        return Ok(());
                    }
                }
                Err(error) => debug!("could not query alternate setting: {error}"),
            }
        }
        debug!("selecting alternate setting {alt}");
        self.requests.transport.set_alt_setting(alt)?;
        self.alt_setting = Some(alt);
        Ok(())
    }

    fn read_layout(&mut self, alt: u8) -> Result<NamedLayout, DfuError> {
        let descriptor = self.requests.transport.alt_setting_name(alt)?;
        let named = parse_layout(&descriptor)?;
        debug!(
            "alt {alt} is \"{}\": {} blocks from {:#010X}",
            named.name,
            named.layout.blocks().len(),
            named.layout.start_address().unwrap_or(0)
        );
        Ok(named)
    }

    /// Issue a DfuSe command and wait for the device to finish executing it.
    fn dfuse_command(
        &mut self,
        command: DfuseCommand,
        events: &mut dyn DfuEvents,
    ) -> Result<(), DfuError> {
        debug!("dfuse: {command}");
        self.requests.dfuse_command(command)?;
        self.expect_dnload_idle(events)
    }

    /// The status-poll loop: re-poll while the device is busy, honouring its
    /// poll timeout, then require dfuDNLOAD-IDLE.
    fn expect_dnload_idle(&mut self, events: &mut dyn DfuEvents) -> Result<(), DfuError> {
        let status = loop {
            let status = self.requests.get_status()?;
            if status.state == DfuState::DnloadBusy {
                self.sleep_poll(&status);
                continue;
            }
            break status;
        };
        if status.state != DfuState::DnloadIdle {
            if status.state == DfuState::Error || status.error != ErrorCode::Ok {
                let message = self.status_message(&status);
                warn!("device reports: {message}");
                events.device_error(&message);
            }
            return Err(DfuError::InvalidState {
                expected: DfuState::DnloadIdle,
                actual: status.state,
            });
        }
        Ok(())
    }

    fn sleep_poll(&self, status: &Status) {
        if status.poll_timeout_ms > 0 {
            thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        }
    }

    /// Best-effort abort so a failed transfer leaves the device recoverable.
    fn recover_on_failure(&mut self, result: Result<(), DfuError>) -> Result<(), DfuError> {
        if let Err(error) = &result
            && self.requests.transport.is_open()
            && !error.device_gone()
        {
            match self.requests.get_status() {
                Ok(status) if status.state.abortable() => {
                    if let Err(abort_error) = self.requests.abort() {
                        debug!("abort on the failure path failed too: {abort_error}");
                    }
                }
                Ok(_) => {}
                Err(status_error) => {
                    debug!("status on the failure path failed: {status_error}");
                }
            }
        }
        result
    }

    fn status_message(&mut self, status: &Status) -> String {
        if status.error == ErrorCode::ErrVendor && status.i_string != 0 {
            match self.requests.transport.string_descriptor(status.i_string) {
                Ok(message) => return message,
                Err(error) => debug!("could not fetch vendor error string: {error}"),
            }
        }
        status.error.to_string()
    }
}

fn emit_progress(events: &mut dyn DfuEvents, transferred: usize, total: usize) {
    let percent = if total == 0 {
        100
    } else {
        (transferred * 100 / total) as u8
    };
    events.progress(percent, transferred);
}
