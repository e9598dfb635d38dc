//! Console pickers. An empty answer cancels.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use kywy_flash_core::boards::{describe_device, UsbDeviceInfo};
#[cfg(feature = "serial")]
use kywy_flash_core::serial::SerialTarget;
use log::warn;

fn ask(question: &str) -> Option<String> {
    print!("{}: ", question);
    io::stdout().flush().ok()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;

    let answer = line.trim();
    (!answer.is_empty()).then(|| answer.to_string())
}

#[cfg(feature = "serial")]
pub fn choose_serial_port(ports: &[SerialTarget]) -> Option<SerialTarget> {
    if ports.is_empty() {
        warn!("No serial ports available");
        return None;
    }

    println!("Serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  [{}] {}", i, port.description());
    }

    let answer = ask("Port number or name (empty to skip)")?;
    match answer.parse::<usize>() {
        Ok(index) => ports.get(index).cloned(),
        Err(_) => ports.iter().find(|p| p.port_name == answer).cloned(),
    }
    .or_else(|| {
        warn!("No serial port '{}'", answer);
        None
    })
}

pub fn choose_usb_device(devices: &[UsbDeviceInfo]) -> Option<UsbDeviceInfo> {
    println!("No Kywy device found. Other USB devices with a vendor interface:");
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {} (bus {} address {})",
            i,
            describe_device(device.vendor_id, device.product_id),
            device.bus_number,
            device.address
        );
    }

    let answer = ask("Device number (empty to skip direct upload)")?;
    answer
        .parse::<usize>()
        .ok()
        .and_then(|index| devices.get(index).copied())
        .or_else(|| {
            warn!("No USB device '{}'", answer);
            None
        })
}

pub fn choose_drive() -> Option<PathBuf> {
    println!("No bootloader drive found. Hold BOOTSEL while plugging the device in to get one.");
    ask("Path of the bootloader drive (empty to cancel)").map(PathBuf::from)
}
