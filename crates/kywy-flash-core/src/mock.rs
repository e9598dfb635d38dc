//! Scripted stand-ins for the host capabilities, recording what was done to them.

use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use crate::{
    boards::UsbDeviceInfo,
    drive::{DriveHandle, DriveProvider},
    reporter::ProgressReporter,
    serial::{SerialLink, SerialProvider, SerialTarget},
    transport::{
        ControlRequest, Direction, EndpointInfo, EndpointKind, InterfaceInfo, TransportError,
        UsbLink, UsbProvider, CLASS_VENDOR_SPECIFIC,
    },
    FlashError, KYWY_VENDOR_ID,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Claim(u8),
    Release(u8),
    Control {
        request_type: u8,
        index: u16,
        data: Vec<u8>,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
    },
    UsbRequest(Option<u16>),
    SerialRequest(Option<u16>),
    SerialOpen {
        port: String,
        baud_rate: u32,
    },
    SerialClose,
    DriveRequest,
    FileWritten {
        name: String,
        len: usize,
    },
}

#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }
}

type OutFailure = Box<dyn FnMut(&[u8]) -> Option<TransportError>>;
type InFailure = Box<dyn FnMut() -> TransportError>;

pub struct MockUsbLink {
    info: UsbDeviceInfo,
    interfaces: Vec<InterfaceInfo>,
    unclaimable: Vec<u8>,
    control_failure: Option<OutFailure>,
    bulk_out_failure: Option<OutFailure>,
    bulk_in_failure: Option<InFailure>,
    journal: Journal,
}

impl MockUsbLink {
    pub fn new(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            info: UsbDeviceInfo {
                vendor_id: KYWY_VENDOR_ID,
                product_id: 0x0003,
                ..Default::default()
            },
            interfaces,
            unclaimable: Vec::new(),
            control_failure: None,
            bulk_out_failure: None,
            bulk_in_failure: None,
            journal: Journal::default(),
        }
    }

    pub fn interface(number: u8, class: u8, subclass: u8, protocol: u8) -> InterfaceInfo {
        InterfaceInfo {
            number,
            alt_setting: 0,
            class,
            subclass,
            protocol,
            endpoints: Vec::new(),
        }
    }

    pub fn bulk_pair() -> Vec<EndpointInfo> {
        vec![
            EndpointInfo {
                address: 0x81,
                direction: Direction::In,
                kind: EndpointKind::Bulk,
            },
            EndpointInfo {
                address: 0x01,
                direction: Direction::Out,
                kind: EndpointKind::Bulk,
            },
        ]
    }

    pub fn hf2_interface(number: u8) -> InterfaceInfo {
        Self::interface(number, CLASS_VENDOR_SPECIFIC, 0x2a, 0x01)
    }

    pub fn picoboot_interface(number: u8) -> InterfaceInfo {
        InterfaceInfo {
            endpoints: Self::bulk_pair(),
            ..Self::interface(number, CLASS_VENDOR_SPECIFIC, 0, 0)
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn with_product_id(mut self, product_id: u16) -> Self {
        self.info.product_id = product_id;
        self
    }

    pub fn with_unclaimable(mut self, number: u8) -> Self {
        self.unclaimable.push(number);
        self
    }

    pub fn with_control_failure(
        mut self,
        failure: impl FnMut(&[u8]) -> Option<TransportError> + 'static,
    ) -> Self {
        self.control_failure = Some(Box::new(failure));
        self
    }

    pub fn with_bulk_out_failure(
        mut self,
        failure: impl FnMut(&[u8]) -> Option<TransportError> + 'static,
    ) -> Self {
        self.bulk_out_failure = Some(Box::new(failure));
        self
    }

    pub fn with_bulk_in_failure(mut self, failure: impl FnMut() -> TransportError + 'static) -> Self {
        self.bulk_in_failure = Some(Box::new(failure));
        self
    }
}

impl UsbLink for MockUsbLink {
    fn info(&self) -> UsbDeviceInfo {
        self.info
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        if self.unclaimable.contains(&number) {
            return Err(TransportError::PermissionDenied);
        }
        self.journal.push(Event::Claim(number));
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError> {
        self.journal.push(Event::Release(number));
        Ok(())
    }

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if let Some(err) = self.control_failure.as_mut().and_then(|fail| fail(data)) {
            return Err(err);
        }
        self.journal.push(Event::Control {
            request_type: request.request_type,
            index: request.index,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if let Some(err) = self.bulk_out_failure.as_mut().and_then(|fail| fail(data)) {
            return Err(err);
        }
        self.journal.push(Event::BulkOut {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if let Some(fail) = self.bulk_in_failure.as_mut() {
            return Err(fail());
        }
        self.journal.push(Event::BulkIn { endpoint });
        Ok(0)
    }
}

pub struct MockUsbProvider {
    device: Option<MockUsbLink>,
    failure: Option<fn() -> FlashError>,
    journal: Journal,
}

impl MockUsbProvider {
    pub fn with_device(device: MockUsbLink) -> Self {
        let journal = device.journal();
        Self {
            device: Some(device),
            failure: None,
            journal,
        }
    }

    pub fn failing(failure: fn() -> FlashError, journal: &Journal) -> Self {
        Self {
            device: None,
            failure: Some(failure),
            journal: journal.clone(),
        }
    }
}

impl UsbProvider for MockUsbProvider {
    fn request_device(
        &mut self,
        vendor_filter: Option<u16>,
    ) -> Result<Box<dyn UsbLink>, FlashError> {
        self.journal.push(Event::UsbRequest(vendor_filter));
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        match self.device.take() {
            Some(device) => Ok(Box::new(device)),
            None => Err(FlashError::NoDeviceFound),
        }
    }
}

pub struct MockSerialProvider {
    ports: Vec<SerialTarget>,
    open_error: Option<TransportError>,
    close_error: Option<TransportError>,
    journal: Journal,
}

impl MockSerialProvider {
    pub fn new(ports: Vec<SerialTarget>) -> Self {
        Self {
            ports,
            open_error: None,
            close_error: None,
            journal: Journal::default(),
        }
    }

    pub fn kywy_port(name: &str) -> SerialTarget {
        SerialTarget {
            port_name: name.to_string(),
            vendor_id: Some(KYWY_VENDOR_ID),
            product_id: Some(0x000a),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn with_open_error(mut self, err: TransportError) -> Self {
        self.open_error = Some(err);
        self
    }

    pub fn with_close_error(mut self, err: TransportError) -> Self {
        self.close_error = Some(err);
        self
    }
}

struct MockSerialLink {
    close_error: Option<TransportError>,
    journal: Journal,
}

impl SerialLink for MockSerialLink {
    fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.journal.push(Event::SerialClose);
        match self.close_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SerialProvider for MockSerialProvider {
    fn request_port(
        &mut self,
        vendor_filter: Option<u16>,
    ) -> Result<Option<SerialTarget>, FlashError> {
        self.journal.push(Event::SerialRequest(vendor_filter));
        Ok(match vendor_filter {
            Some(vid) => self.ports.iter().find(|p| p.vendor_id == Some(vid)).cloned(),
            None => self.ports.first().cloned(),
        })
    }

    fn open(
        &mut self,
        target: &SerialTarget,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialLink>, TransportError> {
        if let Some(err) = self.open_error.clone() {
            return Err(err);
        }
        self.journal.push(Event::SerialOpen {
            port: target.port_name.clone(),
            baud_rate,
        });
        Ok(Box::new(MockSerialLink {
            close_error: self.close_error.clone(),
            journal: self.journal.clone(),
        }))
    }
}

#[derive(Clone, Copy)]
pub enum DriveBehaviour {
    Writable,
    Cancelled,
    WriteFails,
}

pub struct MockDriveProvider {
    behaviour: DriveBehaviour,
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    journal: Journal,
}

impl MockDriveProvider {
    pub fn new(behaviour: DriveBehaviour, journal: &Journal) -> Self {
        Self {
            behaviour,
            files: Rc::default(),
            journal: journal.clone(),
        }
    }

    pub fn files(&self) -> Rc<RefCell<HashMap<String, Vec<u8>>>> {
        self.files.clone()
    }
}

struct MockDrive {
    fails: bool,
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    journal: Journal,
}

impl DriveHandle for MockDrive {
    fn location(&self) -> String {
        "/media/RPI-RP2".to_string()
    }

    fn write_file(
        &mut self,
        name: &str,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), FlashError> {
        if self.fails {
            return Err(FlashError::Io(std::io::Error::other("disk full")));
        }
        progress.start(data.len());
        progress.advance(data.len());
        progress.finish();
        self.files.borrow_mut().insert(name.to_string(), data.to_vec());
        self.journal.push(Event::FileWritten {
            name: name.to_string(),
            len: data.len(),
        });
        Ok(())
    }
}

impl DriveProvider for MockDriveProvider {
    fn request_drive(&mut self) -> Result<Box<dyn DriveHandle>, FlashError> {
        self.journal.push(Event::DriveRequest);
        match self.behaviour {
            DriveBehaviour::Cancelled => Err(FlashError::UserCancelled),
            behaviour => Ok(Box::new(MockDrive {
                fails: matches!(behaviour, DriveBehaviour::WriteFails),
                files: self.files.clone(),
                journal: self.journal.clone(),
            })),
        }
    }
}
