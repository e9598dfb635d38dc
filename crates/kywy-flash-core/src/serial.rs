//! Serial port capability used by the bootloader trigger.

use crate::{boards::describe_device, transport::TransportError, FlashError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTarget {
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl SerialTarget {
    pub fn description(&self) -> String {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => {
                format!("{} ({})", self.port_name, describe_device(vid, pid))
            }
            _ => self.port_name.clone(),
        }
    }
}

/// An open serial port. Closing consumes it.
pub trait SerialLink {
    fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// The "request a serial port" prompt plus the ability to open what it returns.
pub trait SerialProvider {
    /// `Ok(None)` means nothing matched, or the operator picked nothing.
    fn request_port(&mut self, vendor_filter: Option<u16>)
        -> Result<Option<SerialTarget>, FlashError>;

    fn open(
        &mut self,
        target: &SerialTarget,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialLink>, TransportError>;
}

#[cfg(feature = "serial")]
pub use system::{SystemSerialLink, SystemSerialPorts};

#[cfg(feature = "serial")]
mod system {
    use std::{io::Write, time::Duration};

    use log::debug;
    use serialport::{SerialPort, SerialPortType};

    use super::{SerialLink, SerialProvider, SerialTarget};
    use crate::{transport::TransportError, Capability, FlashError};

    type Chooser = Box<dyn FnMut(&[SerialTarget]) -> Option<SerialTarget>>;

    /// Serial ports of the host, enumerated with `serialport`.
    pub struct SystemSerialPorts {
        preferred: Option<String>,
        chooser: Option<Chooser>,
    }

    impl SystemSerialPorts {
        /// `preferred` names a port to use whenever it is present.
        pub fn new(preferred: Option<String>) -> Self {
            Self {
                preferred,
                chooser: None,
            }
        }

        /// Used for unfiltered requests to let the operator pick any port.
        pub fn with_chooser(
            mut self,
            chooser: impl FnMut(&[SerialTarget]) -> Option<SerialTarget> + 'static,
        ) -> Self {
            self.chooser = Some(Box::new(chooser));
            self
        }

        pub fn available() -> Result<Vec<SerialTarget>, FlashError> {
            let ports = serialport::available_ports()
                .map_err(|_| FlashError::EnvironmentUnsupported(Capability::Serial))?;

            Ok(ports
                .into_iter()
                .map(|port| match port.port_type {
                    SerialPortType::UsbPort(usb) => SerialTarget {
                        port_name: port.port_name,
                        vendor_id: Some(usb.vid),
                        product_id: Some(usb.pid),
                    },
                    _ => SerialTarget {
                        port_name: port.port_name,
                        vendor_id: None,
                        product_id: None,
                    },
                })
                .collect())
        }
    }

    impl SerialProvider for SystemSerialPorts {
        fn request_port(
            &mut self,
            vendor_filter: Option<u16>,
        ) -> Result<Option<SerialTarget>, FlashError> {
            let ports = Self::available()?;
            debug!("Found {} serial ports", ports.len());

            if let Some(preferred) = &self.preferred {
                if let Some(port) = ports.iter().find(|p| &p.port_name == preferred) {
                    return Ok(Some(port.clone()));
                }
            }

            match vendor_filter {
                Some(vid) => Ok(ports.into_iter().find(|p| p.vendor_id == Some(vid))),
                None => Ok(self.chooser.as_mut().and_then(|choose| choose(&ports))),
            }
        }

        fn open(
            &mut self,
            target: &SerialTarget,
            baud_rate: u32,
        ) -> Result<Box<dyn SerialLink>, TransportError> {
            let port = serialport::new(&target.port_name, baud_rate)
                .timeout(Duration::from_millis(100))
                .flow_control(serialport::FlowControl::None)
                .open()
                .map_err(serial_error)?;

            Ok(Box::new(SystemSerialLink { port }))
        }
    }

    pub struct SystemSerialLink {
        port: Box<dyn SerialPort>,
    }

    impl SerialLink for SystemSerialLink {
        fn close(mut self: Box<Self>) -> Result<(), TransportError> {
            // The port itself closes on drop, flushing is where a vanished device shows up
            self.port.flush().map_err(TransportError::from)
        }
    }

    fn serial_error(err: serialport::Error) -> TransportError {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::Disconnected,
            serialport::ErrorKind::Io(kind) => std::io::Error::new(kind, err.description).into(),
            _ => TransportError::Other(err.description),
        }
    }
}
