//! The 1200 baud "touch" that makes running firmware reboot into BOOTSEL mode.

use std::thread;

use log::{debug, info};

use crate::{
    config::TriggerConfig,
    serial::{SerialProvider, SerialTarget},
    transport::TransportError,
    FlashError,
};

/// Sends the bootloader reset signal and returns the port it went out on.
///
/// Success only means the signal was sent. The device reboots asynchronously
/// and may take a while to show up as a drive.
pub fn trigger(
    provider: &mut dyn SerialProvider,
    config: &TriggerConfig,
) -> Result<SerialTarget, FlashError> {
    let target = match provider.request_port(Some(config.vendor_id))? {
        Some(target) => target,
        None => {
            debug!(
                "No serial port with vendor id {:#06x}, asking for any port",
                config.vendor_id
            );
            provider
                .request_port(None)?
                .ok_or(FlashError::NoDeviceFound)?
        }
    };

    info!(
        "Sending bootloader reset to {} at {} baud",
        target.description(),
        config.baud_rate
    );

    let link = provider.open(&target, config.baud_rate)?;

    thread::sleep(config.settle_delay);

    match link.close() {
        Ok(()) => {}
        // Expected: the device has already dropped off the bus to reboot
        Err(TransportError::Disconnected) => debug!("Port vanished while closing"),
        Err(err) => return Err(err.into()),
    }

    Ok(target)
}
