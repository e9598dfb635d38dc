//! Direct upload over USB, trying each transfer protocol in turn.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::TransferConfig, reporter::ProgressReporter, transport::TransportError,
    transport::UsbLink, FirmwareImage,
};

pub mod hf2;
pub mod picoboot;
pub mod raw;

pub use hf2::Hf2Strategy;
pub use picoboot::PicobootStrategy;
pub use raw::RawBulkStrategy;

/// How sure we are that a successful transfer really landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Every transfer completed
    Acknowledged,
    /// The device dropped off near the end of the stream and is assumed to
    /// have rebooted into the new firmware. Nothing confirmed it.
    AssumedRebooted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} failed after {sent} of {total} transfers: {source}")]
pub struct TransferError {
    pub stage: &'static str,
    pub sent: usize,
    pub total: usize,
    pub source: TransportError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success(Confirmation),
    /// The protocol is absent or stalled straight away, try the next one
    Unsupported(String),
    Error(TransferError),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success(_))
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Success(Confirmation::Acknowledged) => write!(f, "transfer complete"),
            TransferOutcome::Success(Confirmation::AssumedRebooted) => {
                write!(f, "transfer assumed complete, device rebooted before confirming")
            }
            TransferOutcome::Unsupported(reason) => write!(f, "unsupported: {}", reason),
            TransferOutcome::Error(err) => write!(f, "error: {}", err),
        }
    }
}

/// One way of getting an image onto a device over an open USB handle.
///
/// Implementations claim whatever interface they need and must have released
/// it again by the time they return.
pub trait TransferStrategy {
    fn name(&self) -> &'static str;

    fn try_upload(
        &self,
        device: &mut dyn UsbLink,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome;
}

/// True once `sent` of `total` transfers reaches `percent`.
pub(crate) fn assume_rebooted(sent: usize, total: usize, percent: u8) -> bool {
    total > 0 && sent * 100 >= total * usize::from(percent)
}

/// Tries each strategy in order, stopping at the first one that does not
/// report [`TransferOutcome::Unsupported`].
pub struct DirectTransferEngine {
    strategies: Vec<Box<dyn TransferStrategy>>,
}

impl DirectTransferEngine {
    pub fn new(strategies: Vec<Box<dyn TransferStrategy>>) -> Self {
        Self { strategies }
    }

    /// HF2, then PICOBOOT, then raw bulk streaming.
    pub fn standard(config: &TransferConfig) -> Self {
        Self::new(vec![
            Box::new(Hf2Strategy::new(config)),
            Box::new(PicobootStrategy::new(config)),
            Box::new(RawBulkStrategy::new(config)),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn attempt(
        &self,
        device: &mut dyn UsbLink,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome {
        let mut reasons = Vec::new();

        for strategy in &self.strategies {
            debug!("Trying {} transfer", strategy.name());

            match strategy.try_upload(device, image, progress) {
                TransferOutcome::Unsupported(reason) => {
                    debug!("{} not usable: {}", strategy.name(), reason);
                    reasons.push(format!("{}: {}", strategy.name(), reason));
                }
                outcome => {
                    match &outcome {
                        TransferOutcome::Success(Confirmation::AssumedRebooted) => warn!(
                            "{} transfer not confirmed by the device, assuming it rebooted",
                            strategy.name()
                        ),
                        TransferOutcome::Success(Confirmation::Acknowledged) => {
                            info!("{} transfer complete", strategy.name())
                        }
                        _ => warn!("{} transfer failed: {}", strategy.name(), outcome),
                    }
                    return outcome;
                }
            }
        }

        TransferOutcome::Unsupported(if reasons.is_empty() {
            "no transfer strategies configured".to_string()
        } else {
            reasons.join("; ")
        })
    }
}
