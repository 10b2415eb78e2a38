//! rusb-backed transport and DFU device discovery.
//!
//! The only module that touches `rusb`; everything above it speaks the
//! [`Transport`] trait.

use std::time::Duration;

use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, Language, UsbContext};

use crate::dfu::{
    DfuError, FUNCTIONAL_DESCRIPTOR_LENGTH, FUNCTIONAL_DESCRIPTOR_TYPE, FunctionalDescriptor,
    Identification, TransferError, Transport, Version,
};

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_RUNTIME: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xA1;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

fn map_usb_error(error: rusb::Error) -> TransferError {
    match error {
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice => TransferError::Disconnected,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::NotSupported => TransferError::Unsupported,
        other => TransferError::Other(other.to_string()),
    }
}

/// A DFU interface found during enumeration, not yet opened.
pub struct DfuCandidate {
    device: Device<Context>,
    pub identification: Identification,
    pub interface: u8,
    pub descriptor: FunctionalDescriptor,
}

impl DfuCandidate {
    /// Open the device, claim the DFU interface, and hand back the pieces
    /// [`crate::DfuEngine::new`] wants.
    pub fn open(self) -> Result<(UsbTransport, FunctionalDescriptor, Identification), DfuError> {
        let mut handle = self
            .device
            .open()
            .map_err(|e| DfuError::Transfer(map_usb_error(e)))?;

        if let Ok(true) = handle.kernel_driver_active(self.interface) {
            debug!("detaching kernel driver from interface {}", self.interface);
            handle
                .detach_kernel_driver(self.interface)
                .map_err(|e| DfuError::Transfer(map_usb_error(e)))?;
        }
        handle
            .claim_interface(self.interface)
            .map_err(|e| DfuError::Transfer(map_usb_error(e)))?;

        let language = handle
            .read_languages(TRANSFER_TIMEOUT)
            .ok()
            .and_then(|languages| languages.first().copied());

        let transport = UsbTransport {
            handle: Some(handle),
            interface: self.interface,
            alt_setting: 0,
            language,
        };
        Ok((transport, self.descriptor, self.identification))
    }
}

/// Find the DFU device to operate on.
///
/// All interfaces matching `(vid, pid)` are candidates; when there are none,
/// every DFU interface with the right `vid` qualifies (the device may
/// already sit in DFU mode under a different product id). The first
/// candidate wins.
pub fn find_device(vid: u16, pid: u16) -> Result<DfuCandidate, DfuError> {
    let context = Context::new().map_err(|e| DfuError::Transfer(map_usb_error(e)))?;
    let devices = context
        .devices()
        .map_err(|e| DfuError::Transfer(map_usb_error(e)))?;

    let mut exact = Vec::new();
    let mut vid_only = Vec::new();
    let mut seen_matching_device = false;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != vid {
            continue;
        }
        seen_matching_device = true;
        if let Some(candidate) = inspect_device(&device, &descriptor) {
            if descriptor.product_id() == pid {
                exact.push(candidate);
            } else {
                vid_only.push(candidate);
            }
        }
    }

    let mut candidates = if exact.is_empty() { vid_only } else { exact };
    if candidates.is_empty() {
        return Err(if seen_matching_device {
            DfuError::NoDfuInterface
        } else {
            DfuError::DeviceNotFound { vid, pid }
        });
    }
    if candidates.len() > 1 {
        warn!("{} matching devices, using the first", candidates.len());
    }
    Ok(candidates.swap_remove(0))
}

/// Recognize a DFU interface on the device's active configuration.
fn inspect_device(
    device: &Device<Context>,
    descriptor: &rusb::DeviceDescriptor,
) -> Option<DfuCandidate> {
    let config = device.active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        for iface_desc in interface.descriptors() {
            if iface_desc.class_code() != USB_CLASS_APPLICATION_SPECIFIC
                || iface_desc.sub_class_code() != USB_SUBCLASS_DFU
                || !matches!(
                    iface_desc.protocol_code(),
                    USB_PROTOCOL_RUNTIME | USB_PROTOCOL_DFU_MODE
                )
            {
                continue;
            }
            let Some(functional) = functional_descriptor(iface_desc.extra()) else {
                continue;
            };

            let bcd_device = descriptor.device_version();
            let product_version = Version(
                bcd_device.major(),
                (bcd_device.minor() << 4) | bcd_device.sub_minor(),
            );
            debug!(
                "found DFU interface {} on {:04x}:{:04x}",
                iface_desc.interface_number(),
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            return Some(DfuCandidate {
                device: device.clone(),
                identification: Identification {
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                    product_version,
                    dfu_version: functional.dfu_version,
                },
                interface: iface_desc.interface_number(),
                descriptor: functional,
            });
        }
    }
    None
}

/// The interface must carry exactly one 9-byte DFU functional descriptor.
fn functional_descriptor(extra: &[u8]) -> Option<FunctionalDescriptor> {
    let mut found = None;
    let mut rest = extra;
    while rest.len() >= 2 {
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            return None;
        }
        if rest[1] == FUNCTIONAL_DESCRIPTOR_TYPE {
            if found.is_some() || length != FUNCTIONAL_DESCRIPTOR_LENGTH {
                return None;
            }
            found = FunctionalDescriptor::from_bytes(&rest[..length]).ok();
            found.as_ref()?;
        }
        rest = &rest[length..];
    }
    found
}

/// [`Transport`] over a claimed rusb interface.
pub struct UsbTransport {
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    /// Claimed interfaces start out on alternate setting 0; tracked here so
    /// queries need no USB traffic.
    alt_setting: u8,
    language: Option<Language>,
}

impl UsbTransport {
    fn handle(&self) -> Result<&DeviceHandle<Context>, TransferError> {
        self.handle.as_ref().ok_or(TransferError::Disconnected)
    }

    fn read_string(&self, index: u8) -> Result<String, TransferError> {
        let handle = self.handle()?;
        let text = match self.language {
            Some(language) => handle
                .read_string_descriptor(language, index, TRANSFER_TIMEOUT)
                .map_err(map_usb_error)?,
            None => handle
                .read_string_descriptor_ascii(index)
                .map_err(map_usb_error)?,
        };
        Ok(text.trim_end_matches('\0').to_string())
    }
}

impl Transport for UsbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, TransferError> {
        self.handle()?
            .write_control(
                REQUEST_TYPE_CLASS_INTERFACE_OUT,
                request,
                value,
                self.interface as u16,
                data,
                TRANSFER_TIMEOUT,
            )
            .map_err(map_usb_error)
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransferError> {
        self.handle()?
            .read_control(
                REQUEST_TYPE_CLASS_INTERFACE_IN,
                request,
                value,
                self.interface as u16,
                buf,
                TRANSFER_TIMEOUT,
            )
            .map_err(map_usb_error)
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransferError> {
        let interface = self.interface;
        self.handle
            .as_mut()
            .ok_or(TransferError::Disconnected)?
            .set_alternate_setting(interface, alt)
            .map_err(map_usb_error)?;
        self.alt_setting = alt;
        Ok(())
    }

    fn get_alt_setting(&mut self) -> Result<u8, TransferError> {
        Ok(self.alt_setting)
    }

    fn alt_setting_name(&mut self, alt: u8) -> Result<String, TransferError> {
        let config = self
            .handle()?
            .device()
            .active_config_descriptor()
            .map_err(map_usb_error)?;
        let index = config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .find(|d| d.interface_number() == self.interface && d.setting_number() == alt)
            .and_then(|d| d.description_string_index())
            .ok_or(TransferError::Unsupported)?;
        self.read_string(index)
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransferError> {
        self.read_string(index)
    }

    fn bus_reset(&mut self) -> Result<(), TransferError> {
        self.handle
            .as_mut()
            .ok_or(TransferError::Disconnected)?
            .reset()
            .map_err(map_usb_error)
    }

    fn close(&mut self) {
        // dropping the handle releases the interface
        self.handle = None;
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}
