//! Well-formed reply frames from a unit at address 1.

use super::{encode_frame, Address, CID1_BATTERY};

pub fn hex_text(text: &str, width: usize) -> String {
    let mut hex: String = text.bytes().map(|b| format!("{b:02X}")).collect();
    while hex.len() < width {
        hex.push('0');
    }
    hex
}

pub fn reply(info: &str) -> Vec<u8> {
    encode_frame(Address::new(1), CID1_BATTERY, 0x00, info).into_bytes()
}

/// Status `90`, address error.
pub fn rejected() -> Vec<u8> {
    encode_frame(Address::new(1), CID1_BATTERY, 0x90, "").into_bytes()
}

/// A valid frame with one INFO digit changed.
pub fn corrupted(frame: &[u8]) -> Vec<u8> {
    let mut frame = frame.to_vec();
    frame[14] = if frame[14] == b'0' { b'1' } else { b'0' };
    frame
}

pub fn realtime() -> Vec<u8> {
    reply(&format!("001F4014B4{}", "0".repeat(142)))
}

pub fn system_parameters(cell_count: u16) -> Vec<u8> {
    reply(&format!(
        "{}{cell_count:04X}{}",
        "0".repeat(30),
        "0".repeat(96)
    ))
}

pub fn capacity() -> Vec<u8> {
    reply(&format!("010104FF0000{}", "0".repeat(36)))
}

pub fn serial_number(serial_number: &str) -> Vec<u8> {
    reply(&format!("010103FF0000{}", hex_text(serial_number, 30)))
}

pub fn manufacturer_info() -> Vec<u8> {
    reply(&format!(
        "{}{}{}0102030000",
        hex_text("DR-JC03", 20),
        hex_text("DR48100JC", 20),
        hex_text("P01", 20)
    ))
}
