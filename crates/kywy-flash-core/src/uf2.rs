use assert_into::AssertInto;
use log::{debug, trace};
use static_assertions::const_assert_eq;
use std::mem;
use zerocopy::{
    byteorder::{LittleEndian, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const UF2_MAGIC_START0: u32 = 0x0A324655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;

pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x00000001;
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x00001000;
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x00002000;

pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_PAYLOAD_CAPACITY: usize = 476;

#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Uf2BlockHeader {
    pub magic_start0: U32<LittleEndian>,
    pub magic_start1: U32<LittleEndian>,
    pub flags: U32<LittleEndian>,
    pub target_addr: U32<LittleEndian>,
    pub payload_size: U32<LittleEndian>,
    pub block_no: U32<LittleEndian>,
    pub num_blocks: U32<LittleEndian>,
    pub file_size: U32<LittleEndian>, // or familyID
}

pub type Uf2BlockData = [u8; UF2_PAYLOAD_CAPACITY];

#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Uf2BlockFooter {
    pub magic_end: U32<LittleEndian>,
}

const_assert_eq!(
    mem::size_of::<Uf2BlockHeader>()
        + mem::size_of::<Uf2BlockData>()
        + mem::size_of::<Uf2BlockFooter>(),
    UF2_BLOCK_SIZE
);

const DATA_OFFSET: usize = mem::size_of::<Uf2BlockHeader>();
const FOOTER_OFFSET: usize = DATA_OFFSET + UF2_PAYLOAD_CAPACITY;

/// A contiguous run of bytes destined for flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

impl FlashBlock {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// First address past the end of this block.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// One valid flash record as found in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Uf2Record<'a> {
    pub address: u32,
    pub flags: u32,
    pub block_no: u32,
    pub num_blocks: u32,
    pub family_id: Option<u32>,
    pub data: &'a [u8],
}

fn parse_record(stride: &[u8]) -> Option<Uf2Record<'_>> {
    let (header, _) = Uf2BlockHeader::read_from_prefix(stride).ok()?;
    let footer = Uf2BlockFooter::read_from_bytes(&stride[FOOTER_OFFSET..]).ok()?;

    if header.magic_start0.get() != UF2_MAGIC_START0
        || header.magic_start1.get() != UF2_MAGIC_START1
        || footer.magic_end.get() != UF2_MAGIC_END
    {
        return None;
    }

    let flags = header.flags.get();

    // Payload sizes past the data area show up in the wild, clamp rather than reject
    let len = (header.payload_size.get() as usize).min(UF2_PAYLOAD_CAPACITY);

    // Payload must end inside the 32 bit address space
    let address = header.target_addr.get();
    if u64::from(address) + len as u64 > 1 << 32 {
        return None;
    }

    Some(Uf2Record {
        address,
        flags,
        block_no: header.block_no.get(),
        num_blocks: header.num_blocks.get(),
        family_id: (flags & UF2_FLAG_FAMILY_ID_PRESENT != 0).then(|| header.file_size.get()),
        data: &stride[DATA_OFFSET..DATA_OFFSET + len],
    })
}

/// Iterates over the flash records of a UF2 buffer in file order.
///
/// Strides with bad magics, records flagged as not targeting main flash or as
/// file containers, and a short trailing stride are skipped.
pub fn records(buffer: &[u8]) -> impl Iterator<Item = Uf2Record<'_>> {
    buffer
        .chunks_exact(UF2_BLOCK_SIZE)
        .enumerate()
        .filter_map(|(index, stride)| {
            let Some(record) = parse_record(stride) else {
                trace!("Skipping stride {} at offset {:#x}, not a flash record", index, index * UF2_BLOCK_SIZE);
                return None;
            };

            if record.flags & (UF2_FLAG_NOT_MAIN_FLASH | UF2_FLAG_FILE_CONTAINER) != 0 {
                trace!("Skipping record {} with flags {:#010x}", index, record.flags);
                return None;
            }

            Some(record)
        })
}

/// Decodes a UF2 buffer into flash blocks sorted by address, with adjacent
/// blocks merged.
pub fn decode(buffer: &[u8]) -> Vec<FlashBlock> {
    let mut blocks: Vec<FlashBlock> = records(buffer)
        .map(|record| FlashBlock::new(record.address, record.data.to_vec()))
        .collect();

    let record_count = blocks.len();

    // Stable, so duplicate addresses keep their file order
    blocks.sort_by_key(|block| block.address);

    let mut merged: Vec<FlashBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match merged.last_mut() {
            Some(last) if last.end() == u64::from(block.address) => {
                last.data.extend_from_slice(&block.data)
            }
            _ => merged.push(block),
        }
    }

    debug!(
        "Decoded {} UF2 records into {} flash blocks",
        record_count,
        merged.len()
    );

    merged
}

/// Writes flash blocks out as UF2 records of `page_size` payload bytes each.
///
/// Pages that would start past the 32 bit address space are left out.
pub fn encode(blocks: &[FlashBlock], family_id: u32, page_size: usize) -> Vec<u8> {
    let page_size = page_size.clamp(1, UF2_PAYLOAD_CAPACITY);

    let pages: Vec<(u32, &[u8])> = blocks
        .iter()
        .flat_map(|block| {
            block
                .data
                .chunks(page_size)
                .enumerate()
                .map_while(move |(i, chunk)| {
                    let offset = u32::try_from(i * page_size).ok()?;
                    Some((block.address.checked_add(offset)?, chunk))
                })
        })
        .collect();

    let mut block_header = Uf2BlockHeader {
        magic_start0: U32::new(UF2_MAGIC_START0),
        magic_start1: U32::new(UF2_MAGIC_START1),
        flags: U32::new(UF2_FLAG_FAMILY_ID_PRESENT),
        target_addr: U32::new(0),
        payload_size: U32::new(0),
        block_no: U32::new(0),
        num_blocks: U32::new(pages.len().assert_into()),
        file_size: U32::new(family_id),
    };

    let block_footer = Uf2BlockFooter {
        magic_end: U32::new(UF2_MAGIC_END),
    };

    let mut output = Vec::with_capacity(pages.len() * UF2_BLOCK_SIZE);
    let mut block_data: Uf2BlockData = [0; UF2_PAYLOAD_CAPACITY];

    for (page_num, (target_addr, chunk)) in pages.iter().enumerate() {
        block_header.target_addr = U32::new(*target_addr);
        block_header.payload_size = U32::new(chunk.len().assert_into());
        block_header.block_no = U32::new(page_num.assert_into());

        block_data.iter_mut().for_each(|v| *v = 0);
        block_data[..chunk.len()].copy_from_slice(chunk);

        output.extend_from_slice(block_header.as_bytes());
        output.extend_from_slice(block_data.as_bytes());
        output.extend_from_slice(block_footer.as_bytes());
    }

    output
}
