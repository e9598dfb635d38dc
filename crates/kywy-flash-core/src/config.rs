use std::time::Duration;

use crate::{BOOTLOADER_TOUCH_BAUD_RATE, KYWY_VENDOR_ID};

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub vendor_id: u16,
    pub baud_rate: u32,
    /// Time the port stays open so the device's USB stack sees the line coding change
    pub settle_delay: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            vendor_id: KYWY_VENDOR_ID,
            baud_rate: BOOTLOADER_TOUCH_BAUD_RATE,
            settle_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub timeout: Duration,
    pub status_timeout: Duration,
    /// Share of PICOBOOT writes after which a dropped device counts as rebooted
    pub picoboot_assume_rebooted_percent: u8,
    /// Same for the raw bulk path, which has no status channel at all
    pub raw_assume_rebooted_percent: u8,
    pub raw_chunk_size: usize,
    /// WRITE payloads go out in pieces of this size, each with its own timeout
    pub picoboot_chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(1),
            picoboot_assume_rebooted_percent: 90,
            raw_assume_rebooted_percent: 80,
            raw_chunk_size: 512,
            picoboot_chunk_size: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Name the image gets on the bootloader drive
    pub filename: String,
    pub vendor_id: u16,
    pub direct_enabled: bool,
    /// Fixed wait for the host to mount the drive after the reset touch
    pub drive_mount_wait: Duration,
    pub trigger: TriggerConfig,
    pub transfer: TransferConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            filename: "firmware.uf2".to_string(),
            vendor_id: KYWY_VENDOR_ID,
            direct_enabled: true,
            drive_mount_wait: Duration::from_millis(1500),
            trigger: TriggerConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}
