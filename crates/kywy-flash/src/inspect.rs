use std::{collections::BTreeSet, fs, path::Path};

use kywy_flash_core::{boards::BoardIter, FirmwareImage};
use log::{debug, info, warn};

pub fn inspect<P: AsRef<Path>>(input_path: P) -> Result<(), Box<dyn std::error::Error>> {
    let input = input_path.as_ref();
    let image = FirmwareImage::new(fs::read(input)?);

    let mut records = 0;
    let mut families = BTreeSet::new();
    for record in image.records() {
        records += 1;
        families.extend(record.family_id);
    }

    info!(
        "{}: {} bytes, {} flash records",
        input.display(),
        image.bytes().len(),
        records
    );

    if image.blocks().is_empty() {
        warn!("No flash blocks, this is not a UF2 image");
        return Ok(());
    }

    for family in families {
        match BoardIter::new().find(|board| board.family_id() == family) {
            Some(board) => info!("Family {:#010x} ({})", family, board.board_name()),
            None => info!("Family {:#010x}", family),
        }
    }

    for block in image.blocks() {
        info!(
            "  {:#010x}..{:#010x} {:>8} bytes",
            block.address,
            block.end(),
            block.data.len()
        );
    }

    if let Some((start, end)) = image.span() {
        debug!("Span {:#010x}..{:#010x}", start, end);
    }
    info!(
        "{} blocks, {} payload bytes",
        image.blocks().len(),
        image.payload_len()
    );

    Ok(())
}
