use std::{
    io::{self, Read, Write},
    process,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use kywy_flash_core::{serial::SystemSerialPorts, KYWY_VENDOR_ID, SERIAL_BAUD_RATE};
use log::info;

/// Written to the device when the monitor is closed with Ctrl+C
const TERM_MESSAGE: &[u8] = b"kywy-term\r\n";

/// Waits for the freshly flashed firmware to show up as a serial port, then
/// copies everything it prints to stdout.
pub fn monitor(preferred: Option<&str>, term: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut counter = 0;

    let port_name = 'find_loop: loop {
        for port in SystemSerialPorts::available()? {
            let wanted = match preferred {
                Some(name) => port.port_name == name,
                None => port.vendor_id == Some(KYWY_VENDOR_ID),
            };
            if wanted {
                info!("Found device serial on {}", port.description());
                break 'find_loop Some(port.port_name);
            }
        }

        counter += 1;

        if counter == 100 {
            break None;
        }

        thread::sleep(Duration::from_millis(200));
    };

    let Some(port_name) = port_name else {
        return Err("The device did not come back as a serial port".into());
    };

    for _ in 0..100 {
        if let Ok(port) = serialport::new(&port_name, SERIAL_BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .flow_control(serialport::FlowControl::None)
            .open()
        {
            let port = Arc::new(Mutex::new(port));

            let handler = {
                let port = port.clone();
                move || {
                    if let Ok(mut port) = port.lock() {
                        port.write_all(TERM_MESSAGE).ok();
                        port.flush().ok();
                    }
                    process::exit(0);
                }
            };

            if term {
                ctrlc::set_handler(handler.clone())?;
            }

            let data_terminal_ready_succeeded = match port.lock() {
                Ok(mut port) => port.write_data_terminal_ready(true).is_ok(),
                Err(_) => false,
            };
            if data_terminal_ready_succeeded {
                let mut serial_buf = [0; 1024];
                loop {
                    let read = match port.lock() {
                        Ok(mut port) => port.read(&mut serial_buf),
                        Err(_) => return Err("Serial port lock poisoned".into()),
                    };

                    match read {
                        Ok(t) => {
                            io::stdout().write_all(&serial_buf[..t])?;
                            io::stdout().flush()?;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                            if term {
                                handler();
                            }
                            return Err(e.into());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        thread::sleep(Duration::from_millis(200));
    }

    Err(format!("Could not open {}", port_name).into())
}
