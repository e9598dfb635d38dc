//! Abstract USB device capability consumed by the direct transfer strategies.
//!
//! Failures are classified where the host call is made, so callers can tell
//! a stalled endpoint (the device does not speak this protocol) from a device
//! that went away or a plain transfer failure.

use std::{io, time::Duration};

use log::warn;
use thiserror::Error;

use crate::{boards::UsbDeviceInfo, FlashError};

pub const CLASS_AUDIO: u8 = 0x01;
pub const CLASS_HID: u8 = 0x03;
pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer timed out")]
    Timeout,
    #[error("access denied")]
    PermissionDenied,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_stall(&self) -> bool {
        matches!(self, TransportError::Stall)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotFound => TransportError::Disconnected,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
            // EIO, ENXIO and ENODEV are what a vanished tty reports on unix
            _ if matches!(err.raw_os_error(), Some(5 | 6 | 19)) => TransportError::Disconnected,
            _ => TransportError::Other(err.to_string()),
        }
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Access => TransportError::PermissionDenied,
            err => TransportError::Other(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn endpoint(&self, direction: Direction, kind: EndpointKind) -> Option<u8> {
        self.endpoints
            .iter()
            .find(|e| e.direction == direction && e.kind == kind)
            .map(|e| e.address)
    }

    /// Classes the host will not let user code claim
    pub fn is_protected(&self) -> bool {
        matches!(
            self.class,
            CLASS_AUDIO | CLASS_HID | CLASS_MASS_STORAGE | CLASS_HUB
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// `bmRequestType` for a host-to-device vendor request addressed to an interface
pub const REQUEST_TYPE_VENDOR_INTERFACE_OUT: u8 = 0x41;

/// An opened USB device.
pub trait UsbLink {
    fn info(&self) -> UsbDeviceInfo;

    fn interfaces(&self) -> Vec<InterfaceInfo>;

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError>;

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn bulk_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Hands out opened USB devices, the "request a USB device" prompt.
pub trait UsbProvider {
    /// With a vendor filter only matching devices are offered, without one the
    /// operator may pick anything.
    fn request_device(&mut self, vendor_filter: Option<u16>)
        -> Result<Box<dyn UsbLink>, FlashError>;
}

/// A claimed interface, released again when dropped.
pub struct ClaimedInterface<'a> {
    link: &'a mut dyn UsbLink,
    number: u8,
}

impl<'a> ClaimedInterface<'a> {
    pub fn claim(link: &'a mut dyn UsbLink, number: u8) -> Result<Self, TransportError> {
        link.claim_interface(number)?;
        Ok(Self { link, number })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    /// Vendor control-out request addressed to this interface.
    pub fn vendor_out(
        &mut self,
        request: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let request = ControlRequest {
            request_type: REQUEST_TYPE_VENDOR_INTERFACE_OUT,
            request,
            value: 0,
            index: u16::from(self.number),
        };
        self.link.control_out(request, data, timeout)
    }

    /// Bulk write that fails unless every byte went out.
    pub fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let written = self.link.bulk_out(endpoint, data, timeout)?;
        if written != data.len() {
            return Err(TransportError::Other(format!(
                "short write, {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    pub fn bulk_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.link.bulk_in(endpoint, buf, timeout)
    }
}

impl Drop for ClaimedInterface<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.link.release_interface(self.number) {
            // Usually the device rebooted and the interface is gone with it
            warn!("Could not release interface {}: {}", self.number, err);
        }
    }
}
