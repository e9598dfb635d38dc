use std::{io::Write, path::PathBuf};

use clap::{Args, Parser, ValueEnum};
use env_logger::Env;
use log::*;

use crate::{inspect::inspect, upload::upload};

mod inspect;
#[cfg(feature = "serial")]
mod monitor;
mod prompt;
mod reporter;
mod upload;

#[derive(Args, Debug)]
struct UploadArgs {
    /// Input UF2 file
    input: String,

    /// Name the file gets on the bootloader drive
    #[clap(short, long)]
    filename: Option<String>,

    /// Mount point of the bootloader drive, found automatically if omitted
    #[clap(short, long)]
    drive: Option<PathBuf>,

    /// Serial port of the running firmware
    #[cfg(feature = "serial")]
    #[clap(short, long)]
    port: Option<String>,

    /// Skip the direct USB upload and go straight to the drive copy
    #[clap(long)]
    no_direct: bool,

    /// Connect to serial after upload
    #[cfg(feature = "serial")]
    #[clap(short, long)]
    serial: bool,

    /// Send termination message on Ctrl+C
    #[cfg(feature = "serial")]
    #[clap(short, long)]
    term: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Upload a UF2 file to a connected Kywy
    #[command(arg_required_else_help = true)]
    Upload(UploadArgs),
    /// Print the flash blocks of a UF2 file
    #[command(arg_required_else_help = true)]
    Inspect {
        /// Input UF2 file
        input: String,
    },
    /// Reboot a running Kywy into its bootloader
    #[cfg(feature = "serial")]
    Reset {
        /// Serial port of the running firmware
        #[clap(short, long)]
        port: Option<String>,
    },
}

#[derive(Parser, Debug, Default)]
#[clap(version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Set the logging verbosity
    #[clap(short, long, value_enum, global = true, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

#[cfg(feature = "serial")]
fn reset(port: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    use kywy_flash_core::{serial::SystemSerialPorts, trigger::trigger, TriggerConfig};

    let mut ports = SystemSerialPorts::new(port).with_chooser(prompt::choose_serial_port);
    let target = trigger(&mut ports, &TriggerConfig::default())?;
    info!("Bootloader reset sent on {}", target.port_name);

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(cli.verbose.into())
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level();
            if level == Level::Info {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(buf, "{}: {}", record.level(), record.args())
            }
        })
        .init();

    let command = match cli.command {
        Some(command) => command,
        None => return Ok(()),
    };

    match command {
        Command::Upload(args) => upload(&args),
        Command::Inspect { input } => inspect(&input),
        #[cfg(feature = "serial")]
        Command::Reset { port } => reset(port),
    }
}
