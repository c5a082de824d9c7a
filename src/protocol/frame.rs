use super::checksum::{length_checksum, packet_checksum};
use super::fields::parse_hex;
use super::{Address, ResponseCode, EOI, PROTOCOL_VERSION, SOI};
use crate::Error;
use std::fmt::Write;

// SOI + VER + ADR + CID1 + CID2 + LENGTH
const HEADER_LENGTH: usize = 13;
const CHECKSUM_LENGTH: usize = 4;
const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + CHECKSUM_LENGTH;

/// Assembles a complete ASCII frame including `~` and the trailing `\r`.
///
/// `info` must be an even number of hex digits, at most 4095 of them. An
/// empty `info` yields the length field `0000`.
pub fn encode_frame(address: Address, cid1: u8, cid2: u8, info: &str) -> String {
    debug_assert!(info.len() <= 0x0FFF, "INFO field too long");
    debug_assert!(info.len() % 2 == 0, "INFO field must be hex encoded bytes");

    let mut frame = String::with_capacity(MIN_FRAME_LENGTH + info.len() + 1);
    frame.push(SOI as char);
    let _ = write!(
        frame,
        "{PROTOCOL_VERSION:02X}{}{cid1:02X}{cid2:02X}{:04X}{info}",
        address.to_hex(),
        length_checksum(info.len() as u16)
    );
    let checksum = packet_checksum(&frame[1..]);
    let _ = write!(frame, "{checksum:04X}");
    frame.push(EOI as char);
    frame
}

/// Authenticates a received frame and returns its `INFO` field.
///
/// One trailing `\r` is accepted, hex digits may be of either case. The
/// checks run in protocol order: status code, length checksum, frame
/// checksum. The first failing check decides the error.
pub fn validate_frame(raw: &[u8]) -> Result<&str, Error> {
    let raw = raw.strip_suffix(&[EOI]).unwrap_or(raw);
    if !raw.is_ascii() {
        log::warn!("Invalid frame - non-ASCII data {raw:02X?}");
        return Err(Error::NonAscii);
    }
    let frame = std::str::from_utf8(raw).map_err(|_| Error::NonAscii)?;
    if frame.len() < MIN_FRAME_LENGTH {
        log::warn!(
            "Invalid frame size - required={} received={} frame={frame:?}",
            MIN_FRAME_LENGTH,
            frame.len()
        );
        return Err(Error::FrameTooShort {
            required: MIN_FRAME_LENGTH,
            received: frame.len(),
        });
    }
    if !frame.starts_with(SOI as char) {
        log::warn!("Invalid frame - missing start marker frame={frame:?}");
        return Err(Error::MissingStartMarker);
    }

    let status = ResponseCode::from(parse_hex("CID2", &frame[7..9])? as u8);
    if !status.is_ok() {
        log::warn!("Request rejected - status={status} frame={frame:?}");
        return Err(Error::StatusRejected(status));
    }

    let received = parse_hex("LENGTH", &frame[9..HEADER_LENGTH])? as u16;
    let length = received & 0x0FFF;
    let calculated = length_checksum(length);
    if calculated != received {
        log::warn!(
            "Invalid length checksum - calculated={calculated:04X} received={received:04X}"
        );
        return Err(Error::LengthChecksumMismatch {
            calculated,
            received,
        });
    }

    let checksum_start = frame.len() - CHECKSUM_LENGTH;
    let received = parse_hex("CHKSUM", &frame[checksum_start..])? as u16;
    let calculated = packet_checksum(&frame[1..checksum_start]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} frame={frame:?}"
        );
        return Err(Error::PacketChecksumMismatch {
            calculated,
            received,
        });
    }

    let info = &frame[HEADER_LENGTH..checksum_start];
    if info.len() != usize::from(length) {
        log::warn!(
            "INFO length differs from LENGTH field - field={} actual={}",
            length,
            info.len()
        );
    }
    log::debug!("Valid frame with {} INFO characters", info.len());
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CID1_BATTERY;

    fn reply(info: &str) -> String {
        encode_frame(Address::new(1), CID1_BATTERY, 0x00, info)
    }

    #[test]
    fn encode_realtime_request() {
        assert_eq!(
            encode_frame(Address::new(1), 0x4A, 0x42, "01"),
            "~22014A42E00201FD28\r"
        );
        assert_eq!(
            encode_frame(Address::new(1), 0x4A, 0x51, ""),
            "~22014A510000FDA0\r"
        );
    }

    #[test]
    fn encode_then_validate_recovers_info() {
        let infos = [
            String::new(),
            "01".to_string(),
            "010103FF00".to_string(),
            "0123456789ABCDEF".repeat(20),
            "FF".repeat(0x0FFF / 2),
        ];
        for address in [0x01, 0x02, 0x10, 0xFF] {
            for cid2 in [0x00, 0x42, 0xB0] {
                for info in &infos {
                    let frame = encode_frame(Address::new(address), CID1_BATTERY, cid2, info);
                    if cid2 == 0x00 {
                        assert_eq!(validate_frame(frame.as_bytes()), Ok(info.as_str()));
                    } else {
                        // a request carries a command in the status position
                        assert!(matches!(
                            validate_frame(frame.as_bytes()),
                            Err(Error::StatusRejected(ResponseCode::Unknown(_)))
                        ));
                    }
                }
            }
        }
    }

    #[test]
    fn terminator_is_optional() {
        let frame = reply("0102");
        let trimmed = frame.trim_end_matches('\r');
        assert_eq!(validate_frame(trimmed.as_bytes()), Ok("0102"));
    }

    #[test]
    fn lowercase_hex_is_accepted() {
        let frame = reply("0a0b");
        let (body, checksum) = frame.trim_end_matches('\r').split_at(frame.len() - 5);
        let lowered = format!("{body}{}\r", checksum.to_lowercase());
        assert_eq!(validate_frame(lowered.as_bytes()), Ok("0a0b"));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let frame = reply("0102030405");
        let checksum_start = frame.len() - 5;
        for i in checksum_start..frame.len() - 1 {
            let mut bytes = frame.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            assert!(matches!(
                validate_frame(&bytes),
                Err(Error::PacketChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn corrupted_length_is_rejected() {
        let frame = reply("0102030405");
        for i in 9..13 {
            let mut bytes = frame.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            assert!(matches!(
                validate_frame(&bytes),
                Err(Error::LengthChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn corrupted_info_is_rejected() {
        let frame = reply("0102030405");
        let corrupted = frame.replacen("0102", "0103", 1);
        assert!(matches!(
            validate_frame(corrupted.as_bytes()),
            Err(Error::PacketChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejected_status_is_reported() {
        let frame = encode_frame(Address::new(1), CID1_BATTERY, 0x90, "");
        assert_eq!(
            validate_frame(frame.as_bytes()),
            Err(Error::StatusRejected(ResponseCode::AddressError))
        );
        let frame = encode_frame(Address::new(1), CID1_BATTERY, 0x02, "");
        assert_eq!(
            validate_frame(frame.as_bytes()),
            Err(Error::StatusRejected(ResponseCode::ChecksumError))
        );
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(
            validate_frame(b""),
            Err(Error::FrameTooShort { received: 0, .. })
        ));
        assert!(matches!(
            validate_frame(b"~22014A00\r"),
            Err(Error::FrameTooShort { .. })
        ));
        assert_eq!(
            validate_frame(b"#22014A000000FDA0\r"),
            Err(Error::MissingStartMarker)
        );
        assert_eq!(
            validate_frame("~22014A00\u{e9}000FDA0\r".as_bytes()),
            Err(Error::NonAscii)
        );
        assert!(matches!(
            validate_frame(b"~22014AZZ0000FDA0\r"),
            Err(Error::FieldDecode { field: "CID2", .. })
        ));
        assert!(matches!(
            validate_frame(b"~22014A000000+DA0\r"),
            Err(Error::FieldDecode { field: "CHKSUM", .. })
        ));
    }
}
