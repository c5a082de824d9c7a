//! Provides an asynchronous client for a DR-1363 BMS using Tokio and the
//! `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use daren485_lib::protocol::Address;
//! use daren485_lib::tokio_serial_async::{Daren485, Error};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut bms = Daren485::new("/dev/ttyUSB0", Address::new(1), 19200)?;
//!     bms.set_timeout(Duration::from_millis(500))?;
//!
//!     // poll() reads the system parameters first when the cell count is unknown
//!     let telemetry = bms.poll().await?;
//!     println!("SOC: {}%, cells: {:?}", telemetry.soc_percent, telemetry.cell_voltages);
//!
//!     let identity = bms.get_identity().await?;
//!     println!("Serial number: {}", identity.serial_number);
//!     Ok(())
//! }
//! ```

use crate::protocol::*;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Errors specific to the asynchronous Tokio serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cell count is unknown until `get_system_parameters()` was called.
    #[error("get_system_parameters() has to be called at least once before")]
    SystemParametersRequired,
    /// Nothing was received before the I/O timeout elapsed.
    #[error("No reply from BMS at address {0}")]
    NoReply(Address),
    /// An error originating from the DR-1363 protocol codec.
    #[error("Daren error: {0}")]
    Protocol(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    /// A write did not complete within the I/O timeout.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

/// Asynchronous connection to one BMS on an RS485 bus.
///
/// Holds the cached system parameters, which provide the cell count for
/// realtime data, and the identity of the unit once it has been read.
#[derive(Debug)]
pub struct Daren485<T = tokio_serial::SerialStream> {
    serial: T,
    address: Address,
    last_execution: Instant,
    io_timeout: Duration, // Timeout for individual I/O operations
    delay: Duration,      // Delay between commands
    retries: u8,
    system_parameters: Option<SystemParameters>,
    identity: Option<DeviceIdentity>,
}

macro_rules! request_with_retry {
    ($self:ident, $command:expr, $decode:expr) => {{
        let command = $command;
        let decode = $decode;
        'retry_block: {
            for t in 0..$self.retries {
                match $self.send_and_receive(command).await {
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
            Ok(decode(&$self.send_and_receive(command).await?)?)
        }
    }};
}

/// Reads one frame: everything up to and including `\r`.
///
/// Each read waits at most `timeout`. Reading stops at end of input, on an
/// elapsed timeout or after [`MAX_FRAME_LENGTH`] bytes.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut rx_buffer = Vec::with_capacity(256);
    let mut chunk = [0u8; 64];
    while rx_buffer.len() < MAX_FRAME_LENGTH {
        let received = match tokio::time::timeout(timeout, reader.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(err)) => return Err(err),
        };
        if let Some(end) = chunk[..received].iter().position(|&b| b == EOI) {
            rx_buffer.extend_from_slice(&chunk[..=end]);
            break;
        }
        rx_buffer.extend_from_slice(&chunk[..received]);
    }
    Ok(rx_buffer)
}

/// An asynchronous byte stream to a BMS.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {
    /// Number of received bytes not read yet.
    fn pending_input(&self) -> Result<u32>;
}

impl Transport for tokio_serial::SerialStream {
    fn pending_input(&self) -> Result<u32> {
        Ok(SerialPort::bytes_to_read(self)?)
    }
}

impl Daren485<tokio_serial::SerialStream> {
    /// Opens `port` with 8N1 framing for the unit at `address`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use daren485_lib::protocol::Address;
    /// use daren485_lib::tokio_serial_async::Daren485;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     match Daren485::new("/dev/ttyUSB0", Address::new(2), 19200) {
    ///         Ok(mut bms) => {
    ///             if let Ok(info) = bms.get_manufacturer_info().await {
    ///                 println!("Hardware: {info}");
    ///             }
    ///         }
    ///         Err(err) => eprintln!("Failed to connect to BMS: {err}"),
    ///     }
    /// }
    /// ```
    pub fn new(port: &str, address: Address, baud_rate: u32) -> Result<Self> {
        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(Self::with_transport(serial, address))
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
            io_timeout: Duration::from_secs(1),
            retries: 3,
            system_parameters: None,
            identity: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// sets the number of retries for a failed request
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    /// Asynchronously waits for the configured delay since the last reply.
    async fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    async fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // Drain leftovers so a late reply to an earlier request is not
        // taken for the reply to this one.
        loop {
            log::trace!("read to see if there is any pending data");
            let pending = self.serial.pending_input()?;
            log::trace!("got {pending} pending bytes");
            if pending > 0 {
                let mut buf: Vec<u8> = vec![0; 64];
                let received =
                    tokio::time::timeout(self.io_timeout, self.serial.read(buf.as_mut_slice()))
                        .await??;
                log::trace!("{received} pending bytes consumed");
            } else {
                break;
            }
        }
        self.serial_await_delay().await;

        log::trace!("write bytes: {:?}", String::from_utf8_lossy(tx_buffer));
        tokio::time::timeout(self.io_timeout, self.serial.write_all(tx_buffer)).await??;
        Ok(())
    }

    async fn receive_bytes(&mut self) -> Result<Vec<u8>> {
        let rx_buffer = read_frame(&mut self.serial, self.io_timeout).await?;
        self.last_execution = Instant::now();

        if rx_buffer.is_empty() {
            return Err(Error::NoReply(self.address));
        }
        log::trace!("receive_bytes: {:?}", String::from_utf8_lossy(&rx_buffer));
        Ok(rx_buffer)
    }

    async fn send_and_receive(&mut self, command: Command) -> Result<Vec<u8>> {
        self.send_bytes(&command.request(self.address)).await?;
        self.receive_bytes().await
    }

    /// Sets the timeout for individual I/O operations (read/write) on the serial port.
    ///
    /// A reply is complete when `\r` arrives or when no further byte arrives
    /// within this timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
        Ok(())
    }

    /// Sets the minimum delay between sending commands to the BMS.
    ///
    /// If the provided `delay` is less than `MINIMUM_DELAY` from the `protocol` module,
    /// `MINIMUM_DELAY` will be used.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    /// Asynchronously retrieves SOC, voltages, current, temperatures and the
    /// alarm state.
    ///
    /// **Note:** `get_system_parameters().await` must be called at least once
    /// before this method to determine the number of cells.
    ///
    /// # Returns
    ///
    /// Returns `Error::SystemParametersRequired` if `get_system_parameters().await`
    /// was not called previously.
    pub async fn get_realtime_data(&mut self) -> Result<RealtimeData> {
        log::trace!("get realtime data");
        let n_cells = if let Some(parameters) = &self.system_parameters {
            parameters.cell_count
        } else {
            return Err(Error::SystemParametersRequired);
        };
        request_with_retry!(self, RealtimeData::COMMAND, |reply: &[u8]| {
            RealtimeData::decode(reply, n_cells)
        })
    }

    /// Asynchronously retrieves the cell and pack limits.
    ///
    /// This method also caches the retrieved parameters internally, as the
    /// cell count is required by `get_realtime_data`.
    pub async fn get_system_parameters(&mut self) -> Result<SystemParameters> {
        log::trace!("get system parameters");
        match request_with_retry!(self, SystemParameters::COMMAND, SystemParameters::decode) {
            Ok(parameters) => {
                self.system_parameters = Some(parameters.clone()); // Cache the cell count
                Ok(parameters)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_manufacturer_info(&mut self) -> Result<ManufacturerInfo> {
        log::trace!("get manufacturer info");
        request_with_retry!(self, ManufacturerInfo::COMMAND, ManufacturerInfo::decode)
    }

    pub async fn get_serial_number(&mut self) -> Result<SerialNumber> {
        log::trace!("get serial number");
        request_with_retry!(self, SerialNumber::COMMAND, SerialNumber::decode)
    }

    pub async fn get_capacity_parameters(&mut self) -> Result<CapacityParameters> {
        log::trace!("get capacity parameters");
        request_with_retry!(self, CapacityParameters::COMMAND, CapacityParameters::decode)
    }

    /// Serial number and manufacturer info. Only the first call talks to the
    /// unit, later calls are answered from the cache.
    pub async fn get_identity(&mut self) -> Result<DeviceIdentity> {
        if let Some(identity) = &self.identity {
            log::debug!("Identity of {} from cache", self.address);
            return Ok(identity.clone());
        }
        let identity = DeviceIdentity {
            serial_number: self.get_serial_number().await?,
            manufacturer: self.get_manufacturer_info().await?,
        };
        Ok(self.identity.insert(identity).clone())
    }

    /// Asynchronously reads everything needed for one [`Telemetry`] snapshot.
    pub async fn poll(&mut self) -> Result<Telemetry> {
        if self.system_parameters.is_none() {
            self.get_system_parameters().await?;
        }
        let realtime = self.get_realtime_data().await?;
        let parameters = self.get_system_parameters().await?;
        let capacity = self.get_capacity_parameters().await?;
        Ok(Telemetry::new(&realtime, &parameters, &capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::replies;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    impl Transport for DuplexStream {
        fn pending_input(&self) -> Result<u32> {
            Ok(0)
        }
    }

    /// Spawns a unit that answers each request with the next scripted reply,
    /// `None` stays silent. The handle yields the received requests once the
    /// client is dropped.
    fn scripted_bms(
        replies: Vec<Option<Vec<u8>>>,
    ) -> (Daren485<DuplexStream>, JoinHandle<Vec<String>>) {
        let (client, mut bms) = tokio::io::duplex(MAX_FRAME_LENGTH);
        let handle = tokio::spawn(async move {
            let mut replies = VecDeque::from(replies);
            let mut requests = Vec::new();
            loop {
                let request = read_frame(&mut bms, Duration::from_secs(1))
                    .await
                    .unwrap();
                if request.is_empty() {
                    break;
                }
                requests.push(String::from_utf8_lossy(&request).into_owned());
                if let Some(Some(reply)) = replies.pop_front() {
                    bms.write_all(&reply).await.unwrap();
                }
            }
            requests
        });
        let mut client = Daren485::with_transport(client, Address::new(1));
        client.set_timeout(Duration::from_millis(50)).unwrap();
        (client, handle)
    }

    async fn cid2_sequence(
        client: Daren485<DuplexStream>,
        handle: JoinHandle<Vec<String>>,
    ) -> Vec<String> {
        drop(client);
        handle
            .await
            .unwrap()
            .iter()
            .map(|request| request[7..9].to_string())
            .collect()
    }

    #[tokio::test]
    async fn identity_is_read_once() {
        let (mut bms, handle) = scripted_bms(vec![
            Some(replies::serial_number("DR2024010100001")),
            Some(replies::manufacturer_info()),
        ]);

        let identity = bms.get_identity().await.unwrap();
        assert_eq!(identity.serial_number.to_string(), "DR2024010100001");
        assert_eq!(bms.get_identity().await.unwrap(), identity);
        assert_eq!(cid2_sequence(bms, handle).await, ["B0", "51"]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let realtime = replies::realtime();
        let (mut bms, handle) = scripted_bms(vec![
            Some(replies::corrupted(&realtime)),
            None,
            Some(replies::rejected()),
            Some(realtime),
        ]);
        bms.set_retry(2);

        let err = bms.get_manufacturer_info().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(crate::Error::StatusRejected(ResponseCode::AddressError))
        ));
        assert_eq!(cid2_sequence(bms, handle).await, ["51", "51", "51"]);
    }

    #[tokio::test]
    async fn silence_is_no_reply() {
        let (mut bms, handle) = scripted_bms(vec![]);
        bms.set_retry(1);

        assert!(matches!(
            bms.get_serial_number().await,
            Err(Error::NoReply(_))
        ));
        assert_eq!(cid2_sequence(bms, handle).await, ["B0", "B0"]);
    }

    #[tokio::test]
    async fn poll_reads_parameters_first() {
        let (mut bms, handle) = scripted_bms(vec![
            Some(replies::system_parameters(4)),
            Some(replies::realtime()),
            Some(replies::system_parameters(4)),
            Some(replies::capacity()),
        ]);

        assert!(matches!(
            bms.get_realtime_data().await,
            Err(Error::SystemParametersRequired)
        ));
        let telemetry = bms.poll().await.unwrap();
        assert_eq!(telemetry.cell_count, 4);
        assert_eq!(telemetry.cell_voltages.len(), 4);
        assert_eq!(telemetry.soc_percent, 80.0);
        assert_eq!(cid2_sequence(bms, handle).await, ["47", "42", "47", "B0"]);
    }

    #[tokio::test]
    async fn reads_up_to_terminator() {
        let mut input: &[u8] = b"~22014A510000FDA0\r~22";
        let frame = read_frame(&mut input, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame, b"~22014A510000FDA0\r");
    }

    #[tokio::test]
    async fn silent_line_yields_nothing() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let frame = read_frame(&mut reader, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn partial_frame_is_returned_on_timeout() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(b"~22014A51").await.unwrap();
        let frame = read_frame(&mut reader, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(frame, b"~22014A51");
    }
}
