use crate::protocol::{Command, ResponseCode};

/// Errors produced while building, validating or decoding DR-1363 frames.
///
/// Every variant describes a recoverable outcome of a single exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The frame is shorter than the fixed header plus checksum.
    #[error("Frame too short - required={required} received={received}")]
    FrameTooShort { required: usize, received: usize },
    /// The first character is not the start of information marker `~`.
    #[error("Frame does not start with '~'")]
    MissingStartMarker,
    /// The received bytes contain non-ASCII characters.
    #[error("Frame contains non-ASCII data")]
    NonAscii,
    /// The device answered with a non-success status code.
    #[error("Request rejected by device: {0}")]
    StatusRejected(ResponseCode),
    /// The checksum nibble of the `LENGTH` field does not match its length.
    #[error("Length checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    LengthChecksumMismatch { calculated: u16, received: u16 },
    /// The trailing frame checksum does not match the frame content.
    #[error("Checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    PacketChecksumMismatch { calculated: u16, received: u16 },
    /// The validated payload is too short for the layout of `command`.
    #[error("Payload too short for {command} - required={required} received={received}")]
    PayloadTooShort {
        command: Command,
        required: usize,
        received: usize,
    },
    /// A field does not hold the hex digits or text it is declared as.
    #[error("Cannot decode field '{field}' from {value:?}")]
    FieldDecode { field: &'static str, value: String },
    /// Cell voltages were requested for a cell count the payload cannot hold.
    #[error("Cell count {0} out of range 1..=16")]
    CellCount(u16),
}
