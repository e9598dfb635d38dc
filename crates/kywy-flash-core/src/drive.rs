//! Mass-storage fallback: copying the UF2 file onto the bootloader drive.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{reporter::ProgressReporter, FlashError};

/// The bootrom's virtual drive always carries this file
pub const BOOTLOADER_MARKER_FILE: &str = "INFO_UF2.TXT";

const WRITE_CHUNK_SIZE: usize = 4096;

/// A writable directory on the mounted bootloader drive.
pub trait DriveHandle {
    fn location(&self) -> String;

    /// Creates or overwrites `name` with `data`.
    fn write_file(
        &mut self,
        name: &str,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), FlashError>;
}

/// The "pick a directory" prompt.
pub trait DriveProvider {
    fn request_drive(&mut self) -> Result<Box<dyn DriveHandle>, FlashError>;
}

pub struct MountedDrive {
    root: PathBuf,
}

impl MountedDrive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn is_bootloader_drive(&self) -> bool {
        self.root.join(BOOTLOADER_MARKER_FILE).is_file()
    }
}

impl DriveHandle for MountedDrive {
    fn location(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn write_file(
        &mut self,
        name: &str,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), FlashError> {
        let path = self.root.join(name);
        debug!("Writing {} bytes to {}", data.len(), path.display());

        progress.start(data.len());
        let written = write_synced(&path, data, progress);
        progress.finish();

        discard_partial(&path, written)?;
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8], progress: &mut dyn ProgressReporter) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for chunk in data.chunks(WRITE_CHUNK_SIZE) {
        writer.write_all(chunk)?;
        progress.advance(chunk.len());
    }
    writer.flush()?;
    // The drive only starts flashing once the file is complete on disk
    writer.get_ref().sync_all()
}

/// Removes a half written file so a retry does not find a truncated image.
fn discard_partial(path: &Path, written: io::Result<()>) -> io::Result<()> {
    if written.is_err() && path.exists() {
        if let Err(err) = fs::remove_file(path) {
            warn!("Could not remove partial file {}: {}", path.display(), err);
        }
    }
    written
}

/// Looks for a mounted bootloader drive among the host's disks.
#[cfg(feature = "drive-discovery")]
pub fn find_bootloader_drive() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    for disk in &disks {
        let mount = disk.mount_point();

        if mount.join(BOOTLOADER_MARKER_FILE).is_file() {
            info!("Found bootloader drive {}", &mount.to_string_lossy());
            return Some(mount.to_owned());
        }
    }

    None
}

#[cfg(not(feature = "drive-discovery"))]
pub fn find_bootloader_drive() -> Option<PathBuf> {
    None
}

type Chooser = Box<dyn FnMut() -> Option<PathBuf>>;

/// Picks the drive to copy to: an explicit path, a discovered bootloader
/// drive, or whatever the chooser returns.
pub struct BootloaderDrives {
    explicit: Option<PathBuf>,
    chooser: Option<Chooser>,
}

impl BootloaderDrives {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            chooser: None,
        }
    }

    pub fn with_chooser(mut self, chooser: impl FnMut() -> Option<PathBuf> + 'static) -> Self {
        self.chooser = Some(Box::new(chooser));
        self
    }
}

impl DriveProvider for BootloaderDrives {
    fn request_drive(&mut self) -> Result<Box<dyn DriveHandle>, FlashError> {
        let root = match self.explicit.clone().or_else(find_bootloader_drive) {
            Some(root) => root,
            None => match self.chooser.as_mut() {
                Some(choose) => choose().ok_or(FlashError::UserCancelled)?,
                None => return Err(FlashError::NoDeviceFound),
            },
        };

        if !root.is_dir() {
            return Err(FlashError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            )));
        }

        let drive = MountedDrive::new(root);
        if !drive.is_bootloader_drive() {
            info!(
                "{} has no {}, writing anyway",
                drive.location(),
                BOOTLOADER_MARKER_FILE
            );
        }

        Ok(Box::new(drive))
    }
}
