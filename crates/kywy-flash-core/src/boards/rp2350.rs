use crate::boards::{rp2040::REBOOT_DELAY_MS, BoardInfo, RebootKind};

#[derive(Debug, Default, Clone)]
pub struct RP2350;

impl BoardInfo for RP2350 {
    fn bootloader_product_id(&self) -> u16 {
        0x000f
    }

    fn family_id(&self) -> u32 {
        // This is the rp2350 arm secure family id, should technically always be true if you held the bootsel button down and cycled power.
        RP2350_ARM_S_FAMILY_ID
    }

    fn reboot(&self) -> RebootKind {
        // The RP2350 bootrom dropped REBOOT in favour of REBOOT2
        RebootKind::Reboot2Normal {
            delay_ms: REBOOT_DELAY_MS,
        }
    }

    fn board_name(&self) -> &'static str {
        "rp2350"
    }
}

pub const RP2350_ARM_S_FAMILY_ID: u32 = 0xe48bff59;

