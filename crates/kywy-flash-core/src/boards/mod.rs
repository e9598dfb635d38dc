pub use rp2040::RP2040;
pub use rp2350::RP2350;

use crate::KYWY_VENDOR_ID;

pub mod rp2040;
pub mod rp2350;

/// Product id the Pico SDK uses for its stdio-over-USB serial device
pub const PICO_SDK_STDIO_PRODUCT_ID: u16 = 0x000a;

/// This is a helper struct, which allows you to iterate over every board defined
pub struct BoardIter {
    inner: std::vec::IntoIter<Box<dyn BoardInfo>>,
}

impl BoardIter {
    /// Creates a new BoardIter
    pub fn new() -> Self {
        Self {
            inner: vec![
                Box::new(RP2040) as Box<dyn BoardInfo>,
                Box::new(RP2350),
            ]
            .into_iter(),
        }
    }

    pub fn find_for_device(device: &UsbDeviceInfo) -> Option<Box<dyn BoardInfo>> {
        Self::new().find(|board| board.is_device_board(device))
    }
}

impl Default for BoardIter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for BoardIter {
    type Item = Box<dyn BoardInfo>;
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// This is the usb device information as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// How the bootrom is told to leave BOOTSEL mode after programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    /// PICOBOOT `REBOOT`, jumping to `pc` with `sp` (pc 0 runs the flash image)
    Reboot { pc: u32, sp: u32, delay_ms: u32 },
    /// PICOBOOT `REBOOT2` with the normal boot flags
    Reboot2Normal { delay_ms: u32 },
}

/// This trait helps by allowing for definitions of multiple different boards.
pub trait BoardInfo {
    /// Check if the board is connected to the specified UsbDeviceInfo
    fn is_device_board(&self, device: &UsbDeviceInfo) -> bool {
        device.vendor_id == KYWY_VENDOR_ID && device.product_id == self.bootloader_product_id()
    }

    /// Product id the bootrom enumerates with in BOOTSEL mode
    fn bootloader_product_id(&self) -> u16;

    /// Returns the proper family id to use for the uf2 device
    fn family_id(&self) -> u32;

    /// Optional, with a default erase size of 4096
    fn flash_sector_erase_size(&self) -> u32 {
        4096
    }

    fn reboot(&self) -> RebootKind;

    /// Get the board's name
    fn board_name(&self) -> &'static str;
}

/// Human readable name for a USB device, used when listing or picking devices.
pub fn describe_device(vendor_id: u16, product_id: u16) -> String {
    if vendor_id != KYWY_VENDOR_ID {
        return format!("Unknown device {:04x}:{:04x}", vendor_id, product_id);
    }

    let device = UsbDeviceInfo {
        vendor_id,
        product_id,
        ..Default::default()
    };

    if let Some(board) = BoardIter::find_for_device(&device) {
        return format!("{} bootloader", board.board_name().to_uppercase());
    }

    match product_id {
        PICO_SDK_STDIO_PRODUCT_ID => "Kywy (USB serial)".to_string(),
        _ => format!("Raspberry Pi device {:04x}:{:04x}", vendor_id, product_id),
    }
}
