use std::time::Duration;

use assert_into::AssertInto;
use log::{debug, trace};

use crate::{
    config::TransferConfig,
    direct::{Confirmation, TransferError, TransferOutcome, TransferStrategy},
    reporter::ProgressReporter,
    transport::{ClaimedInterface, InterfaceInfo, UsbLink, CLASS_VENDOR_SPECIFIC},
    FirmwareImage,
};

pub const HF2_INTERFACE_SUBCLASS: u8 = 0x2a;
pub const HF2_INTERFACE_PROTOCOL: u8 = 0x01;

/// Vendor request carrying one HF2 frame
pub const HF2_REQUEST_FRAME: u8 = 0x01;

pub const HF2_CMD_WRITE_FLASH: u8 = 0x01;
pub const HF2_CMD_RESET: u8 = 0x04;

const HF2_FRAME_HEADER_SIZE: usize = 8;

/// opcode, reserved, u16 payload length, u32 target address, payload
pub fn frame(opcode: u8, address: u32, payload: &[u8]) -> Vec<u8> {
    let len: u16 = payload.len().assert_into();

    let mut frame = Vec::with_capacity(HF2_FRAME_HEADER_SIZE + payload.len());
    frame.push(opcode);
    frame.push(0);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&address.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn is_hf2_interface(iface: &InterfaceInfo) -> bool {
    iface.class == CLASS_VENDOR_SPECIFIC
        && iface.subclass == HF2_INTERFACE_SUBCLASS
        && iface.protocol == HF2_INTERFACE_PROTOCOL
}

/// HF2 over vendor control transfers, one write-flash frame per UF2 record.
pub struct Hf2Strategy {
    timeout: Duration,
}

impl Hf2Strategy {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            timeout: config.timeout,
        }
    }
}

impl TransferStrategy for Hf2Strategy {
    fn name(&self) -> &'static str {
        "HF2"
    }

    fn try_upload(
        &self,
        device: &mut dyn UsbLink,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome {
        let Some(iface) = device.interfaces().into_iter().find(is_hf2_interface) else {
            return TransferOutcome::Unsupported("no HF2 interface".to_string());
        };

        let frames: Vec<Vec<u8>> = image
            .records()
            .map(|record| frame(HF2_CMD_WRITE_FLASH, record.address, record.data))
            .collect();

        if frames.is_empty() {
            return TransferOutcome::Unsupported("image has no flash records".to_string());
        }

        let mut claim = match ClaimedInterface::claim(device, iface.number) {
            Ok(claim) => claim,
            Err(err) => {
                return TransferOutcome::Unsupported(format!(
                    "could not claim interface {}: {}",
                    iface.number, err
                ))
            }
        };

        debug!(
            "Sending {} HF2 frames to interface {}",
            frames.len(),
            claim.number()
        );

        progress.start(frames.len());
        for (sent, frame) in frames.iter().enumerate() {
            trace!("HF2 frame {} / {}", sent + 1, frames.len());

            if let Err(source) = claim.vendor_out(HF2_REQUEST_FRAME, frame, self.timeout) {
                progress.finish();
                if source.is_stall() {
                    return TransferOutcome::Unsupported("HF2 frame stalled".to_string());
                }
                return TransferOutcome::Error(TransferError {
                    stage: "HF2 write",
                    sent,
                    total: frames.len(),
                    source,
                });
            }
            progress.advance(1);
        }
        progress.finish();

        // The device resets as soon as it sees this, the transfer may not complete
        if let Err(err) = claim.vendor_out(
            HF2_REQUEST_FRAME,
            &frame(HF2_CMD_RESET, 0, &[]),
            self.timeout,
        ) {
            debug!("HF2 reset frame: {}", err);
        }

        TransferOutcome::Success(Confirmation::Acknowledged)
    }
}
