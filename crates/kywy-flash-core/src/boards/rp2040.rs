use crate::boards::{BoardInfo, RebootKind};

#[derive(Debug, Default, Clone)]
pub struct RP2040;

impl BoardInfo for RP2040 {
    fn bootloader_product_id(&self) -> u16 {
        0x0003
    }

    fn family_id(&self) -> u32 {
        RP2040_FAMILY_ID
    }

    fn reboot(&self) -> RebootKind {
        RebootKind::Reboot {
            pc: 0,
            sp: STACK_POINTER_RP2040,
            delay_ms: REBOOT_DELAY_MS,
        }
    }

    fn board_name(&self) -> &'static str {
        "rp2040"
    }
}

pub const RP2040_FAMILY_ID: u32 = 0xe48bff56;

pub const MAIN_RAM_END_RP2040: u32 = 0x20042000;

/// Initial stack pointer handed to the bootrom on reboot, the top of main RAM
pub const STACK_POINTER_RP2040: u32 = MAIN_RAM_END_RP2040;

pub const REBOOT_DELAY_MS: u32 = 500;
