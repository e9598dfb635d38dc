// see https://datasheets.raspberrypi.com/rp2040/rp2040-datasheet.pdf
// section 2.8.5 for details on PICOBOOT interface

use std::{mem, time::Duration};

use log::{debug, trace, warn};
use static_assertions::const_assert_eq;
use zerocopy::{
    byteorder::{LittleEndian, U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    boards::{BoardInfo, BoardIter, RebootKind, RP2040},
    config::TransferConfig,
    direct::{assume_rebooted, Confirmation, TransferError, TransferOutcome, TransferStrategy},
    reporter::{NoProgress, ProgressReporter},
    transport::{
        ClaimedInterface, Direction, EndpointKind, InterfaceInfo, TransportError, UsbLink,
        CLASS_VENDOR_SPECIFIC,
    },
    FirmwareImage,
};

/// RP MCU magic number for USB interfacing
pub const PICOBOOT_MAGIC: u32 = 0x431FD10B;

pub const PICOBOOT_STATUS_SIZE: usize = 32;

/// Command ID of commands for PICOBOOT interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PicobootCmdId {
    ExclusiveAccess = 0x1,
    Reboot = 0x2,
    FlashErase = 0x3,
    Write = 0x5, // either RAM or FLASH (does no erase)
    ExitXip = 0x6,
    Reboot2 = 0xA, // RP2350 only
}

/// Ask the bootrom to eject the mass-storage drive while we own the device
const EXCLUSIVE_AND_EJECT: u8 = 2;

/// Command structure for PICOBOOT interface.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PicobootCmd {
    magic: U32<LittleEndian>,
    /// Token number to uniquely identify commands and their responses.
    token: U32<LittleEndian>,
    /// The top bit (0x80) indicates data transfer direction.
    cmd_id: u8,
    /// Number of bytes of `args` that are meaningful.
    cmd_size: u8,
    _unused: U16<LittleEndian>,
    /// Bytes to follow over the bulk endpoint(s).
    transfer_len: U32<LittleEndian>,
    /// Command specific args, padded with zeros.
    args: [u8; 16],
}

const_assert_eq!(mem::size_of::<PicobootCmd>(), 32);

fn words(values: [u32; 4]) -> [u8; 16] {
    let mut args = [0; 16];
    for (slot, value) in args.chunks_exact_mut(4).zip(values) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
    args
}

impl PicobootCmd {
    pub fn new(cmd_id: PicobootCmdId, cmd_size: u8, transfer_len: u32, args: [u8; 16]) -> Self {
        Self {
            magic: U32::new(PICOBOOT_MAGIC),
            token: U32::new(0),
            cmd_id: cmd_id as u8,
            cmd_size,
            _unused: U16::new(0),
            transfer_len: U32::new(transfer_len),
            args,
        }
    }

    pub fn with_token(mut self, token: u32) -> Self {
        self.token = U32::new(token);
        self
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    pub fn transfer_len(&self) -> u32 {
        self.transfer_len.get()
    }

    pub fn exclusive_access(exclusive: u8) -> Self {
        let mut args = [0; 16];
        args[0] = exclusive;
        Self::new(PicobootCmdId::ExclusiveAccess, 1, 0, args)
    }

    pub fn exit_xip() -> Self {
        Self::new(PicobootCmdId::ExitXip, 0, 0, [0; 16])
    }

    pub fn flash_erase(addr: u32, size: u32) -> Self {
        Self::new(PicobootCmdId::FlashErase, 8, 0, words([addr, size, 0, 0]))
    }

    pub fn write(addr: u32, size: u32) -> Self {
        Self::new(PicobootCmdId::Write, 8, size, words([addr, size, 0, 0]))
    }

    pub fn reboot(pc: u32, sp: u32, delay_ms: u32) -> Self {
        Self::new(PicobootCmdId::Reboot, 12, 0, words([pc, sp, delay_ms, 0]))
    }

    pub fn reboot2_normal(delay_ms: u32) -> Self {
        Self::new(PicobootCmdId::Reboot2, 16, 0, words([0, delay_ms, 0, 0]))
    }
}

fn picoboot_endpoints(iface: &InterfaceInfo) -> Option<(u8, u8)> {
    if iface.class != CLASS_VENDOR_SPECIFIC || iface.subclass != 0 || iface.protocol != 0 {
        return None;
    }
    let in_addr = iface.endpoint(Direction::In, EndpointKind::Bulk)?;
    let out_addr = iface.endpoint(Direction::Out, EndpointKind::Bulk)?;
    Some((in_addr, out_addr))
}

fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

/// A claimed PICOBOOT interface with its running command token.
struct PicobootSession<'a> {
    claim: ClaimedInterface<'a>,
    in_addr: u8,
    out_addr: u8,
    token: u32,
    chunk_size: usize,
    timeout: Duration,
    status_timeout: Duration,
}

impl PicobootSession<'_> {
    /// Sends a command, its payload if any, then tries to read the status.
    ///
    /// The bootrom programs flash while the payload streams in, so the data
    /// phase goes out in chunks and `progress` advances per chunk.
    fn command(
        &mut self,
        cmd: PicobootCmd,
        payload: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), TransportError> {
        let cmd = cmd.with_token(self.token);
        self.token += 1;

        trace!("PICOBOOT cmd {:#04x} token {}", cmd.cmd_id, cmd.token());

        self.claim
            .bulk_out(self.out_addr, cmd.as_bytes(), self.timeout)?;
        if cmd.transfer_len() != 0 {
            for chunk in payload.chunks(self.chunk_size) {
                self.claim.bulk_out(self.out_addr, chunk, self.timeout)?;
                progress.advance(chunk.len());
            }
        }

        // A device that has started rebooting never answers, that is fine
        let mut status = [0u8; PICOBOOT_STATUS_SIZE];
        if let Err(err) = self
            .claim
            .bulk_in(self.in_addr, &mut status, self.status_timeout)
        {
            trace!("No PICOBOOT status for token {}: {}", cmd.token(), err);
        }

        Ok(())
    }
}

/// The RP2040 bootrom's native vendor interface: erase, write, reboot.
pub struct PicobootStrategy {
    timeout: Duration,
    status_timeout: Duration,
    chunk_size: usize,
    assume_rebooted_percent: u8,
}

impl PicobootStrategy {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            timeout: config.timeout,
            chunk_size: config.picoboot_chunk_size.max(1),
            status_timeout: config.status_timeout,
            assume_rebooted_percent: config.picoboot_assume_rebooted_percent,
        }
    }
}

impl TransferStrategy for PicobootStrategy {
    fn name(&self) -> &'static str {
        "PICOBOOT"
    }

    fn try_upload(
        &self,
        device: &mut dyn UsbLink,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome {
        let found = device
            .interfaces()
            .into_iter()
            .find_map(|iface| picoboot_endpoints(&iface).map(|eps| (iface.number, eps)));
        let Some((number, (in_addr, out_addr))) = found else {
            return TransferOutcome::Unsupported("no PICOBOOT interface".to_string());
        };

        let board: Box<dyn BoardInfo> =
            BoardIter::find_for_device(&device.info()).unwrap_or_else(|| Box::new(RP2040));

        let blocks = image.blocks();
        let Some((start, end)) = image.span() else {
            return TransferOutcome::Unsupported("image has no flash blocks".to_string());
        };

        let sector = u64::from(board.flash_sector_erase_size());
        let erase_start = align_down(u64::from(start), sector);
        let erase_size = align_up(end, sector) - erase_start;
        let (Ok(erase_start), Ok(erase_size)) =
            (u32::try_from(erase_start), u32::try_from(erase_size))
        else {
            return TransferOutcome::Unsupported("image does not fit the address space".to_string());
        };

        let claim = match ClaimedInterface::claim(device, number) {
            Ok(claim) => claim,
            Err(err) => {
                return TransferOutcome::Unsupported(format!(
                    "could not claim interface {}: {}",
                    number, err
                ))
            }
        };

        let mut session = PicobootSession {
            claim,
            in_addr,
            out_addr,
            token: 1,
            chunk_size: self.chunk_size,
            timeout: self.timeout,
            status_timeout: self.status_timeout,
        };

        let total = blocks.len();
        let fail = |stage, sent, source| {
            TransferOutcome::Error(TransferError {
                stage,
                sent,
                total,
                source,
            })
        };

        match session.command(
            PicobootCmd::exclusive_access(EXCLUSIVE_AND_EJECT),
            &[],
            &mut NoProgress,
        ) {
            Ok(()) => {}
            Err(err) if err.is_stall() => {
                return TransferOutcome::Unsupported("PICOBOOT command stalled".to_string())
            }
            Err(err) => return fail("exclusive access", 0, err),
        }

        if let Err(err) = session.command(PicobootCmd::exit_xip(), &[], &mut NoProgress) {
            return fail("exit XIP", 0, err);
        }

        debug!(
            "Erasing {:#010x}..{:#010x} for {} ({})",
            erase_start,
            u64::from(erase_start) + u64::from(erase_size),
            board.board_name(),
            image.payload_len()
        );
        if let Err(err) = session.command(
            PicobootCmd::flash_erase(erase_start, erase_size),
            &[],
            &mut NoProgress,
        ) {
            return fail("flash erase", 0, err);
        }

        progress.start(image.payload_len());
        for (sent, block) in blocks.iter().enumerate() {
            trace!(
                "Block {} / {} {:#010x} ({} bytes)",
                sent + 1,
                total,
                block.address,
                block.data.len()
            );

            // Fits, the whole image span was checked against u32 above
            let len = block.data.len() as u32;
            let write = PicobootCmd::write(block.address, len);
            if let Err(err) = session.command(write, &block.data, progress) {
                progress.finish();
                if assume_rebooted(sent, total, self.assume_rebooted_percent) {
                    warn!(
                        "Device stopped responding after {} of {} blocks ({}), assuming it rebooted",
                        sent, total, err
                    );
                    return TransferOutcome::Success(Confirmation::AssumedRebooted);
                }
                return fail("flash write", sent, err);
            }
        }
        progress.finish();

        let reboot = match board.reboot() {
            RebootKind::Reboot { pc, sp, delay_ms } => PicobootCmd::reboot(pc, sp, delay_ms),
            RebootKind::Reboot2Normal { delay_ms } => PicobootCmd::reboot2_normal(delay_ms),
        };
        if let Err(err) = session.command(reboot, &[], &mut NoProgress) {
            warn!("Image written but reboot command failed: {}", err);
        }

        TransferOutcome::Success(Confirmation::Acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{Event, MockUsbLink},
        reporter::NoProgress,
        uf2, FlashBlock,
    };

    const OUT_EP: u8 = 0x01;

    fn strategy() -> PicobootStrategy {
        PicobootStrategy::new(&TransferConfig::default())
    }

    fn header_of(event: &Event) -> Option<(u8, u32, u32)> {
        match event {
            Event::BulkOut { data, .. } if data.len() == 32 && data[..4] == PICOBOOT_MAGIC.to_le_bytes() => {
                let word = |at: usize| u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
                Some((data[8], word(16), word(20)))
            }
            _ => None,
        }
    }

    /// `count` blocks of 256 bytes, each in its own sector so nothing merges
    fn sparse_image(count: u32) -> FirmwareImage {
        let blocks: Vec<FlashBlock> = (0..count)
            .map(|i| FlashBlock::new(0x1000_0000 + i * 0x1000, vec![i as u8; 256]))
            .collect();
        FirmwareImage::new(uf2::encode(&blocks, 0xe48bff56, 256))
    }

    #[test]
    pub fn command_layout() {
        let cmd = PicobootCmd::write(0x1000_0000, 256).with_token(7);

        assert_eq!(
            cmd.as_bytes(),
            &[
                0x0B, 0xD1, 0x1F, 0x43, // magic
                7, 0, 0, 0, // token
                0x05, 8, 0, 0, // id, args size, reserved
                0, 1, 0, 0, // transfer length
                0, 0, 0, 0x10, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // addr, size
            ][..]
        );
    }

    #[test]
    pub fn erases_span_writes_blocks_and_reboots() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(1)]);
        let journal = device.journal();
        let image = FirmwareImage::new(uf2::encode(
            &[
                FlashBlock::new(0x1000_0000, vec![1; 768]),
                FlashBlock::new(0x1000_2000, vec![2; 256]),
            ],
            0xe48bff56,
            256,
        ));

        let outcome = strategy().try_upload(&mut device, &image, &mut NoProgress);

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::Acknowledged));

        let events = journal.events();
        let headers: Vec<(u8, u32, u32)> = events.iter().filter_map(header_of).collect();
        assert_eq!(
            headers,
            vec![
                (0x01, 2, 0),
                (0x06, 0, 0),
                (0x03, 0x1000_0000, 0x3000),
                (0x05, 0x1000_0000, 768),
                (0x05, 0x1000_2000, 256),
                (0x02, 0, 0x20042000),
            ]
        );
        assert!(events.contains(&Event::BulkOut {
            endpoint: OUT_EP,
            data: vec![2; 256]
        }));
        assert_eq!(events.first(), Some(&Event::Claim(1)));
        assert_eq!(events.last(), Some(&Event::Release(1)));
    }

    #[test]
    pub fn tokens_increase() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)]);
        let journal = device.journal();

        strategy().try_upload(&mut device, &sparse_image(2), &mut NoProgress);

        let tokens: Vec<u32> = journal
            .events()
            .iter()
            .filter(|e| header_of(e).is_some())
            .map(|e| match e {
                Event::BulkOut { data, .. } => u32::from_le_bytes(data[4..8].try_into().unwrap()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tokens, (1..=tokens.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    pub fn missing_status_is_tolerated() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)])
            .with_bulk_in_failure(|| TransportError::Timeout);

        let outcome = strategy().try_upload(&mut device, &sparse_image(3), &mut NoProgress);

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::Acknowledged));
    }

    #[test]
    pub fn stall_on_first_command_is_unsupported() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)])
            .with_bulk_out_failure(|_| Some(TransportError::Stall));
        let journal = device.journal();

        let outcome = strategy().try_upload(&mut device, &sparse_image(3), &mut NoProgress);

        assert!(matches!(outcome, TransferOutcome::Unsupported(_)));
        assert_eq!(journal.events().last(), Some(&Event::Release(0)));
    }

    #[test]
    pub fn failure_near_the_end_assumes_reboot() {
        // Block 95 of 100, the device drops off the bus and stays gone
        let target: u32 = 0x1000_0000 + 94 * 0x1000;
        let mut gone = false;
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)])
            .with_bulk_out_failure(move |data| {
                let is_target = data.len() == 32
                    && data[8] == PicobootCmdId::Write as u8
                    && data[16..20] == target.to_le_bytes();
                gone |= is_target;
                gone.then_some(TransportError::Disconnected)
            });
        let journal = device.journal();

        let outcome = strategy().try_upload(&mut device, &sparse_image(100), &mut NoProgress);

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::AssumedRebooted));
        assert_eq!(journal.events().last(), Some(&Event::Release(0)));
    }

    #[test]
    pub fn failure_midway_is_an_error() {
        let target: u32 = 0x1000_0000 + 10 * 0x1000;
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)])
            .with_bulk_out_failure(move |data| {
                (data.len() == 32 && data[16..20] == target.to_le_bytes() && data[8] == 0x05)
                    .then_some(TransportError::Disconnected)
            });

        let outcome = strategy().try_upload(&mut device, &sparse_image(100), &mut NoProgress);

        assert_eq!(
            outcome,
            TransferOutcome::Error(TransferError {
                stage: "flash write",
                sent: 10,
                total: 100,
                source: TransportError::Disconnected,
            })
        );
    }

    #[derive(Default)]
    struct Steps(Vec<usize>);

    impl ProgressReporter for Steps {
        fn start(&mut self, _total_bytes: usize) {}
        fn advance(&mut self, bytes: usize) {
            self.0.push(bytes);
        }
        fn finish(&mut self) {}
    }

    #[test]
    pub fn large_block_is_written_in_chunks() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)]);
        let journal = device.journal();
        let image = FirmwareImage::new(uf2::encode(
            &[FlashBlock::new(0x1000_0000, vec![7; 10_000])],
            0xe48bff56,
            256,
        ));
        let mut steps = Steps::default();

        let outcome = strategy().try_upload(&mut device, &image, &mut steps);

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::Acknowledged));
        let events = journal.events();
        let headers: Vec<(u8, u32, u32)> = events.iter().filter_map(header_of).collect();
        assert_eq!(
            headers.iter().filter(|(id, ..)| *id == 0x05).collect::<Vec<_>>(),
            vec![&(0x05, 0x1000_0000, 10_000)]
        );
        let data: Vec<usize> = events
            .iter()
            .filter(|e| header_of(e).is_none())
            .filter_map(|e| match e {
                Event::BulkOut { endpoint, data } if *endpoint == OUT_EP => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![4096, 4096, 1808]);
        assert_eq!(steps.0, vec![4096, 4096, 1808]);
    }

    #[test]
    pub fn rp2350_reboots_with_reboot2() {
        let mut device =
            MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)]).with_product_id(0x000f);
        let journal = device.journal();

        let outcome = strategy().try_upload(&mut device, &sparse_image(1), &mut NoProgress);

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::Acknowledged));
        let ids: Vec<u8> = journal.events().iter().filter_map(header_of).map(|h| h.0).collect();
        assert_eq!(ids, vec![0x01, 0x06, 0x03, 0x05, 0x0A]);
    }

    #[test]
    pub fn erase_failure_is_an_error() {
        let mut device = MockUsbLink::new(vec![MockUsbLink::picoboot_interface(0)])
            .with_bulk_out_failure(|data| {
                (data.len() == 32 && data[8] == PicobootCmdId::FlashErase as u8)
                    .then_some(TransportError::Disconnected)
            });
        let journal = device.journal();

        let outcome = strategy().try_upload(&mut device, &sparse_image(4), &mut NoProgress);

        assert_eq!(
            outcome,
            TransferOutcome::Error(TransferError {
                stage: "flash erase",
                sent: 0,
                total: 4,
                source: TransportError::Disconnected,
            })
        );
        assert!(!journal
            .events()
            .iter()
            .filter_map(header_of)
            .any(|(id, ..)| id == PicobootCmdId::Write as u8));
        assert_eq!(journal.events().last(), Some(&Event::Release(0)));
    }
}
