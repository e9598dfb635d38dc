//! This is the backend library logic for kywy-flash.
//!
//! It decodes UF2 images, sends the 1200 baud bootloader touch over a serial
//! port, tries to push the image straight over USB (HF2, PICOBOOT or a raw
//! bulk endpoint) and falls back to copying the file onto the mounted
//! bootloader drive. The host specific pieces (serial ports, USB handles,
//! drives) sit behind the traits in [`serial`], [`transport`] and [`drive`].

use std::fmt;

use thiserror::Error;

pub mod boards;
pub mod config;
pub mod direct;
pub mod drive;
pub mod reporter;
pub mod serial;
pub mod session;
pub mod transport;
pub mod trigger;
pub mod uf2;
#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
mod mock;

pub use config::{TransferConfig, TriggerConfig, UploadConfig};
pub use direct::{Confirmation, DirectTransferEngine, TransferError, TransferOutcome};
pub use session::{Orchestrator, UploadOutcome, UploadReport, UploadState};
pub use transport::TransportError;
pub use uf2::FlashBlock;

/// Raspberry Pi USB vendor id, used to pre-filter device prompts
pub const KYWY_VENDOR_ID: u16 = 0x2e8a;

/// Baud rate for talking to running firmware
pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Opening the port at this baud rate asks the firmware to reboot into its bootloader
pub const BOOTLOADER_TOUCH_BAUD_RATE: u32 = 1200;

/// A host capability the upload flow depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Serial,
    Usb,
    FileSystem,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Serial => write!(f, "serial port"),
            Capability::Usb => write!(f, "USB device"),
            Capability::FileSystem => write!(f, "file system"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("No matching device found")]
    NoDeviceFound,
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Cancelled by user")]
    UserCancelled,
    #[error("{0} access is not available in this environment")]
    EnvironmentUnsupported(Capability),
    #[error("The firmware buffer is empty")]
    EmptyFirmware,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A UF2 image together with the flash blocks decoded from it.
///
/// The raw bytes are kept untouched for the mass-storage copy and the raw bulk
/// path, the merged blocks feed PICOBOOT.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    blocks: Vec<FlashBlock>,
}

impl FirmwareImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        let blocks = uf2::decode(&bytes);
        Self { bytes, blocks }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn blocks(&self) -> &[FlashBlock] {
        &self.blocks
    }

    /// Valid flash records in file order, without merging.
    pub fn records(&self) -> impl Iterator<Item = uf2::Uf2Record<'_>> {
        uf2::records(&self.bytes)
    }

    /// Lowest block address and the end of the highest block.
    pub fn span(&self) -> Option<(u32, u64)> {
        let start = self.blocks.first()?.address;
        let end = self.blocks.iter().map(FlashBlock::end).max()?;
        Some((start, end))
    }

    pub fn payload_len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }
}
