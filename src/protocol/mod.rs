//! DR-1363 framing, checksums and payload decoding.
//!
//! A frame is plain ASCII, every field except the markers is hex encoded:
//!
//! ```text
//! '~' VER(2) ADDR(2) CID1(2) CID2(2) LEN(4) INFO(0..N) CHK(4) '\r'
//! ```
//!
//! Requests carry a command selector in `CID2`, replies carry a status code in
//! the same position. Everything in this module is free of I/O.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod alarm;
mod checksum;
mod fields;
mod frame;
#[cfg(test)]
pub(crate) mod replies;
mod telemetry;

pub use alarm::*;
pub use checksum::{length_checksum, packet_checksum};
pub use frame::{encode_frame, validate_frame};
pub use telemetry::*;

/// Shortest gap between the end of a reply and the next request, the time a
/// USB to RS485 adapter needs to switch from receiving to transmitting.
///
/// A complete reply can take up to 500 ms to arrive after a request. That
/// wait belongs to the read timeout of the clients, not to this gap.
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(10);

/// Start of information marker.
pub const SOI: u8 = b'~';
/// End of information marker.
pub const EOI: u8 = b'\r';
/// Protocol version sent in every request.
pub const PROTOCOL_VERSION: u8 = 0x22;
/// `CID1` of the battery command family.
pub const CID1_BATTERY: u8 = 0x4A;

/// Upper bound for a reply, a full `INFO` field plus framing.
pub const MAX_FRAME_LENGTH: usize = 0x0FFF + 18;

/// Bus address of one unit, as set by its DIP switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(u8);

impl Address {
    pub const fn new(address: u8) -> Self {
        Self(address)
    }

    /// Two uppercase hex digits as used in frames and command info.
    pub fn to_hex(self) -> String {
        format!("{:02X}", self.0)
    }
}

impl Default for Address {
    /// Units are numbered from 1 upwards.
    fn default() -> Self {
        Self(0x01)
    }
}

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for Address {
    fn from(address: u8) -> Self {
        Self(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Parameter blocks of the manufacturer command (`CID2` = `B0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Module {
    OcvParameters = 0x01,
    HardwareProtection = 0x02,
    ManufacturingParameters = 0x03,
    CapacityParameters = 0x04,
}

/// Commands understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Command {
    /// `CID2` = `42`
    RealtimeData,
    /// `CID2` = `47`
    SystemParameters,
    /// `CID2` = `51`
    ManufacturerInfo,
    /// `CID2` = `B0`, sub-selected by module
    ManufacturerParameters(Module),
}

impl Command {
    pub fn cid2(&self) -> u8 {
        match self {
            Command::RealtimeData => 0x42,
            Command::SystemParameters => 0x47,
            Command::ManufacturerInfo => 0x51,
            Command::ManufacturerParameters(_) => 0xB0,
        }
    }

    /// The `INFO` field the command is sent with.
    pub fn info(&self, address: Address) -> String {
        match self {
            Command::RealtimeData | Command::SystemParameters => address.to_hex(),
            Command::ManufacturerInfo => String::new(),
            Command::ManufacturerParameters(module) => {
                // command group, operation (01 = read), module, function id, function length
                format!("{}01{:02X}FF00", address.to_hex(), *module as u8)
            }
        }
    }

    /// Length of the command echo that prefixes the reply payload.
    pub fn echo_length(&self) -> usize {
        match self {
            Command::ManufacturerParameters(_) => 12,
            _ => 0,
        }
    }

    /// Builds the complete request frame for the unit at `address`.
    pub fn request(&self, address: Address) -> Vec<u8> {
        encode_frame(address, CID1_BATTERY, self.cid2(), &self.info(address)).into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::RealtimeData => write!(f, "realtime data"),
            Command::SystemParameters => write!(f, "system parameters"),
            Command::ManufacturerInfo => write!(f, "manufacturer info"),
            Command::ManufacturerParameters(Module::OcvParameters) => write!(f, "OCV parameters"),
            Command::ManufacturerParameters(Module::HardwareProtection) => {
                write!(f, "hardware protection parameters")
            }
            Command::ManufacturerParameters(Module::ManufacturingParameters) => {
                write!(f, "manufacturing parameters")
            }
            Command::ManufacturerParameters(Module::CapacityParameters) => {
                write!(f, "capacity parameters")
            }
        }
    }
}

/// Status code carried in `CID2` of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResponseCode {
    Normal,
    VersionError,
    ChecksumError,
    LengthChecksumError,
    InvalidCid2,
    CommandFormatError,
    InvalidData,
    AddressError,
    CommunicationError,
    Unknown(u8),
}

impl ResponseCode {
    pub fn is_ok(&self) -> bool {
        *self == ResponseCode::Normal
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ResponseCode::Normal,
            0x01 => ResponseCode::VersionError,
            0x02 => ResponseCode::ChecksumError,
            0x03 => ResponseCode::LengthChecksumError,
            0x04 => ResponseCode::InvalidCid2,
            0x05 => ResponseCode::CommandFormatError,
            0x06 => ResponseCode::InvalidData,
            0x90 => ResponseCode::AddressError,
            0x91 => ResponseCode::CommunicationError,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseCode::Normal => write!(f, "Normal"),
            ResponseCode::VersionError => write!(f, "Protocol version error"),
            ResponseCode::ChecksumError => write!(f, "Checksum error"),
            ResponseCode::LengthChecksumError => write!(f, "Length checksum error"),
            ResponseCode::InvalidCid2 => write!(f, "CID2 invalid"),
            ResponseCode::CommandFormatError => write!(f, "Command format error"),
            ResponseCode::InvalidData => write!(f, "INFO data invalid"),
            ResponseCode::AddressError => write!(f, "Address error"),
            ResponseCode::CommunicationError => write!(f, "Battery communication error"),
            ResponseCode::Unknown(code) => write!(f, "Unknown status code 0x{code:02X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_str(command: Command, address: u8) -> String {
        String::from_utf8(command.request(Address::new(address))).unwrap()
    }

    #[test]
    fn documented_requests() {
        assert_eq!(
            request_str(Command::RealtimeData, 1),
            "~22014A42E00201FD28\r"
        );
        assert_eq!(
            request_str(Command::SystemParameters, 1),
            "~22014A47E00201FD23\r"
        );
        assert_eq!(
            request_str(Command::ManufacturerInfo, 1),
            "~22014A510000FDA0\r"
        );
        assert_eq!(
            request_str(
                Command::ManufacturerParameters(Module::ManufacturingParameters),
                1
            ),
            "~22014AB0600A010103FF00FB6C\r"
        );
        assert_eq!(
            request_str(Command::ManufacturerParameters(Module::CapacityParameters), 1),
            "~22014AB0600A010104FF00FB6B\r"
        );
    }

    #[test]
    fn address_is_echoed() {
        let request = request_str(Command::RealtimeData, 0x0C);
        assert_eq!(&request[..15], "~220C4A42E0020C");
    }

    #[test]
    fn response_codes() {
        assert!(ResponseCode::from(0x00).is_ok());
        assert_eq!(ResponseCode::from(0x03), ResponseCode::LengthChecksumError);
        assert_eq!(ResponseCode::from(0x91), ResponseCode::CommunicationError);
        assert_eq!(ResponseCode::from(0x42), ResponseCode::Unknown(0x42));
        assert!(!ResponseCode::from(0x90).is_ok());
    }
}
