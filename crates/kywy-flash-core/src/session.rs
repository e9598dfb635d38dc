//! The upload state machine: direct USB first, then bootloader reset and a
//! copy onto the mass-storage drive.

use std::{fmt, thread};

use log::{debug, info, warn};

use crate::{
    config::UploadConfig,
    direct::{Confirmation, DirectTransferEngine, TransferOutcome},
    drive::DriveProvider,
    reporter::{NoProgress, ProgressReporter},
    serial::SerialProvider,
    transport::{UsbLink, UsbProvider},
    trigger, Capability, FirmwareImage, FlashError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    AttemptingDirect,
    TriggeringBootloader,
    AwaitingDriveMount,
    WritingMassStorage,
    Terminal,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Idle => "idle",
            UploadState::AttemptingDirect => "direct upload",
            UploadState::TriggeringBootloader => "bootloader reset",
            UploadState::AwaitingDriveMount => "waiting for drive",
            UploadState::WritingMassStorage => "drive copy",
            UploadState::Terminal => "done",
        };
        f.write_str(name)
    }
}

/// Which route got the firmware onto the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPath {
    Direct,
    MassStorage,
}

/// One tier of the fallback chain and how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub state: UploadState,
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success {
        path: UploadPath,
        confirmation: Confirmation,
        message: String,
    },
    /// Nothing landed automatically, the operator has to copy the file
    PartialManual { message: String },
    Failure { message: String },
}

impl UploadOutcome {
    pub fn message(&self) -> &str {
        match self {
            UploadOutcome::Success { message, .. }
            | UploadOutcome::PartialManual { message }
            | UploadOutcome::Failure { message } => message,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success { .. })
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub outcome: UploadOutcome,
    pub attempts: Vec<AttemptRecord>,
}

/// Observer of the single status line an upload exposes.
pub trait StatusSink {
    fn update(&mut self, state: UploadState, status: &str);
}

impl<F: FnMut(UploadState, &str)> StatusSink for F {
    fn update(&mut self, state: UploadState, status: &str) {
        self(state, status)
    }
}

/// Everything belonging to one upload, dropped once it reaches a terminal state.
struct UploadSession {
    image: FirmwareImage,
    filename: String,
    attempts: Vec<AttemptRecord>,
}

impl UploadSession {
    fn record(&mut self, state: UploadState, succeeded: bool, detail: impl Into<String>) {
        let detail = detail.into();
        debug!("{}: {}", state, detail);
        self.attempts.push(AttemptRecord {
            state,
            succeeded,
            detail,
        });
    }

    fn finish(self, outcome: UploadOutcome) -> UploadReport {
        UploadReport {
            outcome,
            attempts: self.attempts,
        }
    }
}

fn unavailable(capability: Capability) -> String {
    FlashError::EnvironmentUnsupported(capability).to_string()
}

/// Drives uploads through the fallback chain.
///
/// Host capabilities are optional. A missing one skips its tier with a status
/// message instead of failing the whole upload.
pub struct Orchestrator {
    config: UploadConfig,
    engine: DirectTransferEngine,
    usb: Option<Box<dyn UsbProvider>>,
    serial: Option<Box<dyn SerialProvider>>,
    drives: Option<Box<dyn DriveProvider>>,
    status: Option<Box<dyn StatusSink>>,
    progress: Box<dyn ProgressReporter>,
    state: UploadState,
}

impl Orchestrator {
    pub fn new(config: UploadConfig) -> Self {
        let engine = DirectTransferEngine::standard(&config.transfer);
        Self {
            config,
            engine,
            usb: None,
            serial: None,
            drives: None,
            status: None,
            progress: Box::new(NoProgress),
            state: UploadState::Idle,
        }
    }

    pub fn with_usb(mut self, usb: Box<dyn UsbProvider>) -> Self {
        self.usb = Some(usb);
        self
    }

    pub fn with_serial(mut self, serial: Box<dyn SerialProvider>) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn with_drives(mut self, drives: Box<dyn DriveProvider>) -> Self {
        self.drives = Some(drives);
        self
    }

    pub fn with_status(mut self, status: impl StatusSink + 'static) -> Self {
        self.status = Some(Box::new(status));
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Runs one upload to a terminal state.
    ///
    /// Only an empty buffer is an error, everything else ends in an
    /// [`UploadOutcome`] with a message for the operator.
    pub fn upload(&mut self, firmware: Vec<u8>) -> Result<UploadReport, FlashError> {
        if firmware.is_empty() {
            return Err(FlashError::EmptyFirmware);
        }

        let mut session = UploadSession {
            image: FirmwareImage::new(firmware),
            filename: self.config.filename.clone(),
            attempts: Vec::new(),
        };

        let outcome = self.run(&mut session);
        self.set_status(UploadState::Terminal, outcome.message());
        self.state = UploadState::Idle;

        Ok(session.finish(outcome))
    }

    fn run(&mut self, session: &mut UploadSession) -> UploadOutcome {
        if session.image.blocks().is_empty() {
            return UploadOutcome::Failure {
                message: "The file is not a UF2 image: it contains no flash blocks".to_string(),
            };
        }

        info!(
            "Uploading {} ({} bytes, {} flash blocks)",
            session.filename,
            session.image.bytes().len(),
            session.image.blocks().len()
        );

        if self.config.direct_enabled {
            if let Some(outcome) = self.attempt_direct(session) {
                return outcome;
            }
        } else {
            session.record(UploadState::AttemptingDirect, false, "disabled");
        }

        self.trigger_bootloader(session);

        self.set_status(UploadState::AwaitingDriveMount, "Waiting for the bootloader drive");
        thread::sleep(self.config.drive_mount_wait);

        self.write_mass_storage(session)
    }

    fn set_status(&mut self, state: UploadState, status: &str) {
        self.state = state;
        info!("{}", status);
        if let Some(sink) = self.status.as_mut() {
            sink.update(state, status);
        }
    }

    fn request_usb_device(&mut self) -> Result<Box<dyn UsbLink>, FlashError> {
        let Some(usb) = self.usb.as_mut() else {
            return Err(FlashError::EnvironmentUnsupported(Capability::Usb));
        };
        match usb.request_device(Some(self.config.vendor_id)) {
            Err(FlashError::NoDeviceFound) => {
                debug!("No USB device with vendor id {:#06x}", self.config.vendor_id);
                usb.request_device(None)
            }
            result => result,
        }
    }

    fn attempt_direct(&mut self, session: &mut UploadSession) -> Option<UploadOutcome> {
        self.set_status(UploadState::AttemptingDirect, "Trying direct USB upload");

        let mut device = match self.request_usb_device() {
            Ok(device) => device,
            Err(err) => {
                session.record(UploadState::AttemptingDirect, false, err.to_string());
                return None;
            }
        };

        debug!("Direct strategies: {}", self.engine.strategy_names().join(", "));
        let outcome = self
            .engine
            .attempt(device.as_mut(), &session.image, self.progress.as_mut());
        // Close the handle before anything else touches the device
        drop(device);

        match outcome {
            TransferOutcome::Success(confirmation) => {
                session.record(UploadState::AttemptingDirect, true, outcome.to_string());
                let message = match confirmation {
                    Confirmation::Acknowledged => "Firmware uploaded over USB".to_string(),
                    Confirmation::AssumedRebooted => "Firmware uploaded over USB. The device \
                        rebooted before confirming the last transfers, so the result is not \
                        confirmed"
                        .to_string(),
                };
                Some(UploadOutcome::Success {
                    path: UploadPath::Direct,
                    confirmation,
                    message,
                })
            }
            outcome => {
                session.record(UploadState::AttemptingDirect, false, outcome.to_string());
                None
            }
        }
    }

    fn trigger_bootloader(&mut self, session: &mut UploadSession) {
        self.set_status(
            UploadState::TriggeringBootloader,
            "Resetting the device into its bootloader",
        );

        let Some(serial) = self.serial.as_mut() else {
            session.record(
                UploadState::TriggeringBootloader,
                false,
                unavailable(Capability::Serial),
            );
            return;
        };

        // The device may already sit in its bootloader, so carry on regardless
        match trigger::trigger(serial.as_mut(), &self.config.trigger) {
            Ok(target) => session.record(
                UploadState::TriggeringBootloader,
                true,
                format!("reset sent on {}", target.port_name),
            ),
            Err(err) => {
                warn!("Bootloader reset failed: {}", err);
                session.record(UploadState::TriggeringBootloader, false, err.to_string());
            }
        }
    }

    fn write_mass_storage(&mut self, session: &mut UploadSession) -> UploadOutcome {
        self.set_status(
            UploadState::WritingMassStorage,
            "Copying the firmware to the bootloader drive",
        );

        let manual = |reason: String, filename: &str| UploadOutcome::PartialManual {
            message: format!(
                "Could not copy the firmware automatically ({}). Copy {} to the bootloader \
                 drive manually",
                reason, filename
            ),
        };

        let Some(drives) = self.drives.as_mut() else {
            let reason = unavailable(Capability::FileSystem);
            session.record(UploadState::WritingMassStorage, false, reason.clone());
            return manual(reason, &session.filename);
        };

        let written = drives.request_drive().and_then(|mut drive| {
            drive.write_file(
                &session.filename,
                session.image.bytes(),
                self.progress.as_mut(),
            )?;
            Ok(drive.location())
        });

        match written {
            Ok(location) => {
                session.record(UploadState::WritingMassStorage, true, location.clone());
                UploadOutcome::Success {
                    path: UploadPath::MassStorage,
                    confirmation: Confirmation::Acknowledged,
                    message: format!("Firmware copied to {}", location),
                }
            }
            Err(err) => {
                warn!("Drive copy failed: {}", err);
                session.record(UploadState::WritingMassStorage, false, err.to_string());
                manual(err.to_string(), &session.filename)
            }
        }
    }
}
