use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use daren485_lib::protocol::Address;
use daren485_lib::serialport::Daren485;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

macro_rules! print_realtime_data {
    ($bms:expr) => {{
        let _ = $bms
            .get_system_parameters()
            .with_context(|| "Cannot get system parameters")?;
        println!(
            "Realtime data: {:?}",
            $bms.get_realtime_data()
                .with_context(|| "Cannot get realtime data")?
        )
    }};
}
macro_rules! print_system_parameters {
    ($bms:expr) => {
        println!(
            "System parameters: {:?}",
            $bms.get_system_parameters()
                .with_context(|| "Cannot get system parameters")?
        )
    };
}
macro_rules! print_manufacturer_info {
    ($bms:expr) => {
        println!(
            "Manufacturer: {}",
            $bms.get_manufacturer_info()
                .with_context(|| "Cannot get manufacturer info")?
        )
    };
}
macro_rules! print_serial_number {
    ($bms:expr) => {
        println!(
            "Serial number: {}",
            $bms.get_serial_number()
                .with_context(|| "Cannot get serial number")?
        )
    };
}
macro_rules! print_capacity_parameters {
    ($bms:expr) => {
        println!(
            "Capacity: {:?}",
            $bms.get_capacity_parameters()
                .with_context(|| "Cannot get capacity parameters")?
        )
    };
}
macro_rules! print_identity {
    ($bms:expr) => {{
        let identity = $bms.get_identity().with_context(|| "Cannot get identity")?;
        println!(
            "Identity: serial number {}, {}",
            identity.serial_number, identity.manufacturer
        )
    }};
}
macro_rules! print_telemetry {
    ($bms:expr) => {
        println!(
            "Telemetry: {:?}",
            $bms.poll().with_context(|| "Cannot poll BMS")?
        )
    };
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let mut bms = Daren485::new(&args.device, Address::new(args.address), args.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout)?;
    bms.set_delay(args.delay);
    bms.set_retry(args.retries);

    match args.command {
        CliCommands::Realtime => print_realtime_data!(bms),
        CliCommands::Parameters => print_system_parameters!(bms),
        CliCommands::Manufacturer => print_manufacturer_info!(bms),
        CliCommands::Serial => print_serial_number!(bms),
        CliCommands::Capacity => print_capacity_parameters!(bms),
        CliCommands::Identity => print_identity!(bms),
        CliCommands::Poll => print_telemetry!(bms),
        CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(bms, output, interval, metrics)?,
    }

    Ok(())
}
