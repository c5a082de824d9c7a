//! Blocking client for a DR-1363 BMS on a serial port, built on the
//! `serialport` crate.
//!
//! # Example
//!
//! ```no_run
//! use daren485_lib::protocol::Address;
//! use daren485_lib::serialport::{Daren485, Error};
//!
//! fn main() -> Result<(), Error> {
//!     let mut bms = Daren485::new("/dev/ttyUSB0", Address::new(1), 19200)?;
//!
//!     // The cell count comes from the system parameters.
//!     let parameters = bms.get_system_parameters()?;
//!     println!("{} cells", parameters.cell_count);
//!
//!     let realtime = bms.get_realtime_data()?;
//!     println!("SOC: {}%", realtime.soc_percent);
//!     Ok(())
//! }
//! ```

use crate::protocol::*;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Errors of the blocking serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cell count is unknown until the system parameters were read.
    #[error("get_system_parameters() has to be called at least once before")]
    SystemParametersRequired,
    /// Nothing was received before the timeout elapsed.
    #[error("No reply from BMS at address {0}")]
    NoReply(Address),
    #[error("Daren error: {0}")]
    Protocol(#[from] crate::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

type Result<T> = std::result::Result<T, Error>;

macro_rules! request_with_retry {
    ($self:ident, $command:expr, $decode:expr) => {{
        let command = $command;
        let decode = $decode;
        'retry_block: {
            for t in 0..$self.retries {
                match $self.send_and_receive(command) {
                    Ok(reply_bytes) => match decode(&reply_bytes) {
                        Ok(result) => break 'retry_block Ok(result),
                        Err(err) => {
                            log::trace!(
                                "Failed try {} of {}, repeating ({err})",
                                t + 1,
                                $self.retries
                            );
                        }
                    },
                    Err(err) => {
                        log::trace!(
                            "Failed try {} of {}, repeating ({err})",
                            t + 1,
                            $self.retries
                        );
                    }
                }
            }
            Ok(decode(&$self.send_and_receive(command)?)?)
        }
    }};
}

/// Reads one frame: everything up to and including `\r`.
///
/// Stops early on end of input, a read timeout or [`MAX_FRAME_LENGTH`]
/// bytes. Bytes following the terminator in the same read are dropped.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut rx_buffer = Vec::with_capacity(256);
    let mut chunk = [0u8; 64];
    while rx_buffer.len() < MAX_FRAME_LENGTH {
        let received = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(received) => received,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if let Some(end) = chunk[..received].iter().position(|&b| b == EOI) {
            rx_buffer.extend_from_slice(&chunk[..=end]);
            break;
        }
        rx_buffer.extend_from_slice(&chunk[..received]);
    }
    Ok(rx_buffer)
}

/// A byte stream to a BMS.
pub trait Transport: Read + Write {
    /// Number of received bytes not read yet.
    fn pending_input(&self) -> Result<u32>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn pending_input(&self) -> Result<u32> {
        Ok(self.bytes_to_read()?)
    }
}

#[derive(Debug)]
pub struct Daren485<T = Box<dyn serialport::SerialPort>> {
    serial: T,
    address: Address,
    last_execution: Instant,
    delay: Duration,
    retries: u8,
    system_parameters: Option<SystemParameters>,
    identity: Option<DeviceIdentity>,
}

impl Daren485<Box<dyn serialport::SerialPort>> {
    /// Opens `port` with 8N1 framing for the unit at `address`.
    pub fn new(port: &str, address: Address, baud_rate: u32) -> Result<Self> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_secs(1))
            .open()?;
        Ok(Self::with_transport(serial, address))
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        log::trace!("set timeout to {timeout:?}");
        Ok(self.serial.set_timeout(timeout)?)
    }
}

impl<T: Transport> Daren485<T> {
    /// Talks to the unit at `address` over an already opened stream.
    pub fn with_transport(serial: T, address: Address) -> Self {
        Self {
            serial,
            address,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            retries: 3,
            system_parameters: None,
            identity: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sets the number of retries for a failed request.
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // a late reply to an earlier request must not be taken for this one
        loop {
            let pending = self.serial.pending_input()?;
            if pending > 0 {
                log::trace!("Got {pending} pending bytes");
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.serial.read(buf.as_mut_slice())?;
                log::trace!("Read {received} pending bytes");
            } else {
                break;
            }
        }
        self.serial_await_delay();

        log::trace!("write bytes: {:?}", String::from_utf8_lossy(tx_buffer));
        self.serial.write_all(tx_buffer)?;
        Ok(())
    }

    fn receive_bytes(&mut self) -> Result<Vec<u8>> {
        let rx_buffer = read_frame(&mut self.serial)?;
        self.last_execution = Instant::now();

        if rx_buffer.is_empty() {
            return Err(Error::NoReply(self.address));
        }
        log::trace!("receive_bytes: {:?}", String::from_utf8_lossy(&rx_buffer));
        Ok(rx_buffer)
    }

    fn send_and_receive(&mut self, command: Command) -> Result<Vec<u8>> {
        self.send_bytes(&command.request(self.address))?;
        self.receive_bytes()
    }

    fn n_cells(&self) -> Result<u16> {
        self.system_parameters
            .as_ref()
            .map(|parameters| parameters.cell_count)
            .ok_or(Error::SystemParametersRequired)
    }

    /// Measurements, counters and alarm state.
    ///
    /// **Note:** `get_system_parameters()` must be called at least once
    /// before, the cell count is taken from its reply.
    pub fn get_realtime_data(&mut self) -> Result<RealtimeData> {
        log::trace!("get realtime data");
        let n_cells = self.n_cells()?;
        request_with_retry!(self, RealtimeData::COMMAND, |reply: &[u8]| {
            RealtimeData::decode(reply, n_cells)
        })
    }

    /// Limits and configuration. The reply is cached for the cell count.
    pub fn get_system_parameters(&mut self) -> Result<SystemParameters> {
        log::trace!("get system parameters");
        match request_with_retry!(self, SystemParameters::COMMAND, SystemParameters::decode) {
            Ok(parameters) => {
                self.system_parameters = Some(parameters.clone());
                Ok(parameters)
            }
            Err(err) => Err(err),
        }
    }

    pub fn get_manufacturer_info(&mut self) -> Result<ManufacturerInfo> {
        log::trace!("get manufacturer info");
        request_with_retry!(self, ManufacturerInfo::COMMAND, ManufacturerInfo::decode)
    }

    pub fn get_serial_number(&mut self) -> Result<SerialNumber> {
        log::trace!("get serial number");
        request_with_retry!(self, SerialNumber::COMMAND, SerialNumber::decode)
    }

    pub fn get_capacity_parameters(&mut self) -> Result<CapacityParameters> {
        log::trace!("get capacity parameters");
        request_with_retry!(self, CapacityParameters::COMMAND, CapacityParameters::decode)
    }

    /// Serial number and manufacturer info, read from the unit once and
    /// answered from the cache afterwards.
    pub fn get_identity(&mut self) -> Result<DeviceIdentity> {
        if let Some(identity) = &self.identity {
            log::debug!("Identity of {} from cache", self.address);
            return Ok(identity.clone());
        }
        let identity = DeviceIdentity {
            serial_number: self.get_serial_number()?,
            manufacturer: self.get_manufacturer_info()?,
        };
        Ok(self.identity.insert(identity).clone())
    }

    /// One complete reading of the unit.
    pub fn poll(&mut self) -> Result<Telemetry> {
        if self.system_parameters.is_none() {
            self.get_system_parameters()?;
        }
        let realtime = self.get_realtime_data()?;
        let parameters = self.get_system_parameters()?;
        let capacity = self.get_capacity_parameters()?;
        Ok(Telemetry::new(&realtime, &parameters, &capacity))
    }
}
