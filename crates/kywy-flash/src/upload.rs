use std::{fs, path::Path};

use kywy_flash_core::{
    drive::BootloaderDrives, session::UploadOutcome, usb::RusbProvider, Orchestrator,
    UploadConfig,
};
use log::{debug, warn, LevelFilter};

use crate::{prompt, reporter::ProgressBarReporter, UploadArgs};

pub fn upload(args: &UploadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let input = Path::new(&args.input);
    let firmware = fs::read(input)?;

    let mut config = UploadConfig {
        direct_enabled: !args.no_direct,
        ..Default::default()
    };
    if let Some(filename) = &args.filename {
        config.filename = filename.clone();
    }

    let drives = BootloaderDrives::new(args.drive.clone()).with_chooser(prompt::choose_drive);
    let mut orchestrator = Orchestrator::new(config).with_drives(Box::new(drives));

    match RusbProvider::new() {
        Ok(usb) => {
            let usb = usb.with_chooser(prompt::choose_usb_device);
            orchestrator = orchestrator.with_usb(Box::new(usb));
        }
        Err(err) => warn!("{}", err),
    }

    #[cfg(feature = "serial")]
    {
        use kywy_flash_core::serial::SystemSerialPorts;

        let ports =
            SystemSerialPorts::new(args.port.clone()).with_chooser(prompt::choose_serial_port);
        orchestrator = orchestrator.with_serial(Box::new(ports));
    }

    if log::max_level() >= LevelFilter::Info {
        orchestrator = orchestrator.with_progress(Box::new(ProgressBarReporter::new()));
    }

    let report = orchestrator.upload(firmware)?;

    for attempt in &report.attempts {
        debug!(
            "{}: {} ({})",
            attempt.state,
            if attempt.succeeded { "ok" } else { "skipped" },
            attempt.detail
        );
    }

    match report.outcome {
        UploadOutcome::Success { .. } => {}
        UploadOutcome::PartialManual { message } | UploadOutcome::Failure { message } => {
            return Err(message.into())
        }
    }

    #[cfg(feature = "serial")]
    if args.serial {
        log::info!("Waiting for the device to restart");
        crate::monitor::monitor(args.port.as_deref(), args.term)?;
    }

    Ok(())
}
