use std::time::Duration;

use log::{debug, warn};

use crate::{
    config::TransferConfig,
    direct::{assume_rebooted, Confirmation, TransferError, TransferOutcome, TransferStrategy},
    reporter::ProgressReporter,
    transport::{ClaimedInterface, Direction, EndpointKind, InterfaceInfo, UsbLink},
    FirmwareImage,
};

fn out_endpoint(iface: &InterfaceInfo) -> Option<u8> {
    iface
        .endpoint(Direction::Out, EndpointKind::Bulk)
        .or_else(|| iface.endpoint(Direction::Out, EndpointKind::Interrupt))
}

/// Last resort: stream the UF2 bytes as-is to the first claimable OUT endpoint.
pub struct RawBulkStrategy {
    timeout: Duration,
    chunk_size: usize,
    assume_rebooted_percent: u8,
}

impl RawBulkStrategy {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            timeout: config.timeout,
            chunk_size: config.raw_chunk_size.max(1),
            assume_rebooted_percent: config.raw_assume_rebooted_percent,
        }
    }

    fn stream(
        &self,
        mut claim: ClaimedInterface<'_>,
        endpoint: u8,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome {
        let chunks: Vec<&[u8]> = image.bytes().chunks(self.chunk_size).collect();
        let total = chunks.len();

        debug!(
            "Streaming {} bytes in {} chunks to interface {} endpoint {:#04x}",
            image.bytes().len(),
            total,
            claim.number(),
            endpoint
        );

        progress.start(image.bytes().len());
        for (sent, chunk) in chunks.iter().enumerate() {
            if let Err(source) = claim.bulk_out(endpoint, chunk, self.timeout) {
                progress.finish();

                if sent == 0 && source.is_stall() {
                    return TransferOutcome::Unsupported("endpoint stalled on first chunk".to_string());
                }
                if assume_rebooted(sent, total, self.assume_rebooted_percent) {
                    warn!(
                        "Endpoint failed after {} of {} chunks ({}), assuming the device rebooted",
                        sent, total, source
                    );
                    return TransferOutcome::Success(Confirmation::AssumedRebooted);
                }
                return TransferOutcome::Error(TransferError {
                    stage: "raw stream",
                    sent,
                    total,
                    source,
                });
            }
            progress.advance(chunk.len());
        }
        progress.finish();

        TransferOutcome::Success(Confirmation::Acknowledged)
    }
}

impl TransferStrategy for RawBulkStrategy {
    fn name(&self) -> &'static str {
        "raw bulk"
    }

    fn try_upload(
        &self,
        device: &mut dyn UsbLink,
        image: &FirmwareImage,
        progress: &mut dyn ProgressReporter,
    ) -> TransferOutcome {
        let candidates: Vec<(u8, u8)> = device
            .interfaces()
            .iter()
            .filter(|iface| !iface.is_protected())
            .filter_map(|iface| out_endpoint(iface).map(|ep| (iface.number, ep)))
            .collect();

        // The first interface the host lets us have gets the stream
        for (number, endpoint) in candidates {
            match ClaimedInterface::claim(&mut *device, number) {
                Ok(claim) => return self.stream(claim, endpoint, image, progress),
                Err(err) => debug!("Interface {} not claimable: {}", number, err),
            }
        }

        TransferOutcome::Unsupported("no claimable interface with an OUT endpoint".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{Event, MockUsbLink},
        reporter::NoProgress,
        transport::{TransportError, CLASS_MASS_STORAGE},
    };

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new(vec![0x5A; len])
    }

    fn cdc_data_interface(number: u8) -> InterfaceInfo {
        let mut iface = MockUsbLink::interface(number, 0x0a, 0, 0);
        iface.endpoints = MockUsbLink::bulk_pair();
        iface
    }

    #[test]
    pub fn streams_chunks_to_first_unprotected_interface() {
        let mut msc = MockUsbLink::interface(0, CLASS_MASS_STORAGE, 6, 80);
        msc.endpoints = MockUsbLink::bulk_pair();
        let mut device = MockUsbLink::new(vec![msc, cdc_data_interface(1)]);
        let journal = device.journal();

        let outcome = RawBulkStrategy::new(&TransferConfig::default()).try_upload(
            &mut device,
            &image(1100),
            &mut NoProgress,
        );

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::Acknowledged));
        let sizes: Vec<usize> = journal
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::BulkOut { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![512, 512, 76]);
        assert!(!journal.events().contains(&Event::Claim(0)));
        assert_eq!(journal.events().last(), Some(&Event::Release(1)));
    }

    #[test]
    pub fn unclaimable_interfaces_are_passed_over() {
        let mut device = MockUsbLink::new(vec![cdc_data_interface(0), cdc_data_interface(1)])
            .with_unclaimable(0);
        let journal = device.journal();

        let outcome = RawBulkStrategy::new(&TransferConfig::default()).try_upload(
            &mut device,
            &image(100),
            &mut NoProgress,
        );

        assert!(outcome.is_success());
        assert_eq!(journal.events().first(), Some(&Event::Claim(1)));
    }

    #[test]
    pub fn first_chunk_stall_is_unsupported() {
        let mut device = MockUsbLink::new(vec![cdc_data_interface(0)])
            .with_bulk_out_failure(|_| Some(TransportError::Stall));

        let outcome = RawBulkStrategy::new(&TransferConfig::default()).try_upload(
            &mut device,
            &image(4096),
            &mut NoProgress,
        );

        assert!(matches!(outcome, TransferOutcome::Unsupported(_)));
    }

    #[test]
    pub fn late_failure_assumes_reboot() {
        let mut calls = 0;
        let mut device = MockUsbLink::new(vec![cdc_data_interface(0)]).with_bulk_out_failure(
            move |_| {
                calls += 1;
                (calls > 9).then_some(TransportError::Stall)
            },
        );

        let outcome = RawBulkStrategy::new(&TransferConfig::default()).try_upload(
            &mut device,
            &image(512 * 10),
            &mut NoProgress,
        );

        assert_eq!(outcome, TransferOutcome::Success(Confirmation::AssumedRebooted));
    }

    #[test]
    pub fn early_failure_is_an_error() {
        let mut calls = 0;
        let mut device = MockUsbLink::new(vec![cdc_data_interface(0)]).with_bulk_out_failure(
            move |_| {
                calls += 1;
                (calls > 2).then_some(TransportError::Disconnected)
            },
        );
        let journal = device.journal();

        let outcome = RawBulkStrategy::new(&TransferConfig::default()).try_upload(
            &mut device,
            &image(512 * 10),
            &mut NoProgress,
        );

        assert!(matches!(
            outcome,
            TransferOutcome::Error(TransferError { sent: 2, total: 10, .. })
        ));
        assert_eq!(journal.events().last(), Some(&Event::Release(0)));
    }
}
