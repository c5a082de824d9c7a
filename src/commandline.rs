use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show SOC, voltages, current, temperatures, FET state and alarms (fetches the cell count first)
    Realtime,
    /// Show cell and pack limits, cell count and barcodes
    Parameters,
    /// Show hardware type, product and project code and firmware version
    Manufacturer,
    /// Show the serial number of the unit
    Serial,
    /// Show remaining, full and design capacity and the charge history
    Capacity,
    /// Show serial number and manufacturer information
    Identity,
    /// Show one complete telemetry snapshot
    Poll,
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (telemetry, realtime, parameters, capacity, identity or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "telemetry,identity")]
        metrics: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    /// One topic per value
    Simple,
    /// All metrics of one cycle as a single JSON document
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "daren DR-1363 (RS485) bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Bus address of the BMS as set by its DIP switches (decimal or 0x prefixed hex)
    #[arg(short, long, value_parser = maybe_hex::<u8>, default_value = "1")]
    pub address: u8,

    /// Serial baud rate
    #[arg(short, long, default_value_t = 19200)]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "100ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between sending multiple commands to the BMS (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15ms")]
    pub delay: Duration,

    /// Number of retries for failed commands
    #[arg(long, default_value = "3")]
    pub retries: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["daren485", "poll"]).unwrap();
        assert_eq!(args.address, 1);
        assert_eq!(args.baud_rate, 19200);
        assert_eq!(args.retries, 3);
        assert_eq!(args.timeout, Duration::from_millis(500));
        assert_eq!(args.command, CliCommands::Poll);
    }

    #[test]
    fn hex_address() {
        let args = CliArgs::try_parse_from(["daren485", "--address", "0x0C", "serial"]).unwrap();
        assert_eq!(args.address, 12);
        let args = CliArgs::try_parse_from(["daren485", "-a", "16", "serial"]).unwrap();
        assert_eq!(args.address, 16);
        assert!(CliArgs::try_parse_from(["daren485", "-a", "0x100", "serial"]).is_err());
    }

    #[test]
    fn daemon_metrics() {
        let args = CliArgs::try_parse_from([
            "daren485",
            "daemon",
            "--interval",
            "1m",
            "--metrics",
            "realtime,capacity",
            "mqtt",
            "--format",
            "json",
        ])
        .unwrap();
        match args.command {
            CliCommands::Daemon {
                output,
                interval,
                metrics,
            } => {
                assert_eq!(interval, Duration::from_secs(60));
                assert_eq!(metrics, vec!["realtime", "capacity"]);
                assert_eq!(
                    output,
                    DaemonOutput::Mqtt {
                        config_file: mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string(),
                        format: MqttFormat::Json
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
