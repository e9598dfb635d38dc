//! [`UsbLink`] and [`UsbProvider`] over libusb.

use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};

use crate::{
    boards::{describe_device, UsbDeviceInfo},
    transport::{
        ControlRequest, Direction, EndpointInfo, EndpointKind, InterfaceInfo, TransportError,
        UsbLink, UsbProvider, CLASS_VENDOR_SPECIFIC,
    },
    Capability, FlashError,
};

/// Interfaces of the active configuration, first alternate setting only.
fn describe_interfaces<T: UsbContext>(device: &Device<T>) -> Result<Vec<InterfaceInfo>, rusb::Error> {
    let config = device.active_config_descriptor()?;

    let interfaces = config
        .interfaces()
        .filter_map(|iface| iface.descriptors().next())
        .map(|desc| InterfaceInfo {
            number: desc.interface_number(),
            alt_setting: desc.setting_number(),
            class: desc.class_code(),
            subclass: desc.sub_class_code(),
            protocol: desc.protocol_code(),
            endpoints: desc
                .endpoint_descriptors()
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    direction: match ep.direction() {
                        rusb::Direction::In => Direction::In,
                        rusb::Direction::Out => Direction::Out,
                    },
                    kind: match ep.transfer_type() {
                        TransferType::Control => EndpointKind::Control,
                        TransferType::Isochronous => EndpointKind::Isochronous,
                        TransferType::Bulk => EndpointKind::Bulk,
                        TransferType::Interrupt => EndpointKind::Interrupt,
                    },
                })
                .collect(),
        })
        .collect();

    Ok(interfaces)
}

pub struct RusbLink<T: UsbContext> {
    handle: DeviceHandle<T>,
    info: UsbDeviceInfo,
    interfaces: Vec<InterfaceInfo>,
    /// Interfaces we took away from a kernel driver and owe back
    detached: Vec<u8>,
}

impl<T: UsbContext> UsbLink for RusbLink<T> {
    fn info(&self) -> UsbDeviceInfo {
        self.info
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        if let Ok(true) = self.handle.kernel_driver_active(number) {
            self.handle.detach_kernel_driver(number)?;
            self.detached.push(number);
        }
        self.handle.claim_interface(number)?;
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError> {
        let released = self.handle.release_interface(number);

        if let Some(pos) = self.detached.iter().position(|&n| n == number) {
            self.detached.remove(pos);
            if let Err(err) = self.handle.attach_kernel_driver(number) {
                debug!("Could not reattach kernel driver to interface {}: {}", number, err);
            }
        }

        released.map_err(TransportError::from)
    }

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.handle.write_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            data,
            timeout,
        )?)
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }
}

type Chooser = Box<dyn FnMut(&[UsbDeviceInfo]) -> Option<UsbDeviceInfo>>;

/// Picks the device to open among `candidates`.
///
/// With a vendor filter the first candidate is taken. Without one nothing is
/// opened unless the chooser names a device; a chooser that declines is a
/// cancellation.
fn select_device(
    candidates: &[UsbDeviceInfo],
    vendor_filter: Option<u16>,
    chooser: Option<&mut Chooser>,
) -> Result<UsbDeviceInfo, FlashError> {
    if vendor_filter.is_some() {
        return candidates.first().copied().ok_or(FlashError::NoDeviceFound);
    }
    if candidates.is_empty() {
        return Err(FlashError::NoDeviceFound);
    }
    let Some(choose) = chooser else {
        debug!(
            "{} unknown vendor specific devices present, none opened without a chooser",
            candidates.len()
        );
        return Err(FlashError::NoDeviceFound);
    };

    let chosen = choose(candidates).ok_or(FlashError::UserCancelled)?;
    if candidates.contains(&chosen) {
        Ok(chosen)
    } else {
        Err(FlashError::NoDeviceFound)
    }
}

/// Picks USB devices off the libusb device list.
///
/// With a vendor filter the first device of that vendor is opened. Without
/// one the devices exposing a vendor specific interface go to the chooser.
pub struct RusbProvider {
    context: Context,
    chooser: Option<Chooser>,
}

impl RusbProvider {
    pub fn new() -> Result<Self, FlashError> {
        let context = Context::new().map_err(|err| {
            warn!("libusb is not usable: {}", err);
            FlashError::EnvironmentUnsupported(Capability::Usb)
        })?;
        Ok(Self {
            context,
            chooser: None,
        })
    }

    /// Used for unfiltered requests to let the operator pick a device.
    pub fn with_chooser(
        mut self,
        chooser: impl FnMut(&[UsbDeviceInfo]) -> Option<UsbDeviceInfo> + 'static,
    ) -> Self {
        self.chooser = Some(Box::new(chooser));
        self
    }
}

impl UsbProvider for RusbProvider {
    fn request_device(
        &mut self,
        vendor_filter: Option<u16>,
    ) -> Result<Box<dyn UsbLink>, FlashError> {
        let devices = self.context.devices().map_err(TransportError::from)?;

        let mut candidates = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let interfaces = match describe_interfaces(&device) {
                Ok(interfaces) => interfaces,
                Err(err) => {
                    debug!(
                        "Skipping {:04x}:{:04x}: {}",
                        desc.vendor_id(),
                        desc.product_id(),
                        err
                    );
                    continue;
                }
            };

            let wanted = match vendor_filter {
                Some(vendor_id) => desc.vendor_id() == vendor_id,
                None => interfaces.iter().any(|i| i.class == CLASS_VENDOR_SPECIFIC),
            };
            if wanted {
                let info = UsbDeviceInfo {
                    bus_number: device.bus_number(),
                    address: device.address(),
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                };
                candidates.push((info, device, interfaces));
            }
        }

        let infos: Vec<UsbDeviceInfo> = candidates.iter().map(|(info, ..)| *info).collect();
        let info = select_device(&infos, vendor_filter, self.chooser.as_mut())?;
        let Some((_, device, interfaces)) = candidates.into_iter().find(|(i, ..)| *i == info)
        else {
            return Err(FlashError::NoDeviceFound);
        };

        let name = describe_device(info.vendor_id, info.product_id);
        info!(
            "Using {} on bus {} address {}",
            name, info.bus_number, info.address
        );

        let handle = device.open().map_err(|err| match err {
            rusb::Error::Access => FlashError::PermissionDenied(format!(
                "cannot open {}, check the udev rules or run with more privileges",
                name
            )),
            err => TransportError::from(err).into(),
        })?;

        Ok(Box::new(RusbLink {
            handle,
            info,
            interfaces,
            detached: Vec::new(),
        }))
    }
}
