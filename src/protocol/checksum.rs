/// Checksum of a frame: the 16-bit two's complement of the sum of all
/// character codes in `text`.
pub fn packet_checksum(text: &str) -> u16 {
    text.bytes()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(b)))
        .wrapping_neg()
}

/// Combines the 12-bit `length` of an `INFO` field with its checksum nibble.
///
/// The checksum is the two's complement of the nibble sum, modulo 16, placed
/// in bits 12..16. Bits of `length` above 12 are ignored.
pub fn length_checksum(length: u16) -> u16 {
    let length = length & 0x0FFF;
    let sum = (length & 0xF) + ((length >> 4) & 0xF) + ((length >> 8) & 0xF);
    let nibble = ((sum & 0xF) ^ 0xF).wrapping_add(1) & 0xF;
    length | (nibble << 12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn packet_checksum_of_requests() {
        assert_eq!(packet_checksum("22014A42E00201"), 0xFD28);
        assert_eq!(packet_checksum("22014A510000"), 0xFDA0);
        assert_eq!(packet_checksum(""), 0);
    }

    #[test]
    fn length_checksum_values() {
        assert_eq!(length_checksum(0), 0x0000);
        assert_eq!(length_checksum(2), 0xE002);
        assert_eq!(length_checksum(10), 0x600A);
        assert_eq!(length_checksum(18), 0xD012);
        // nibble sum 0x10 folds to a zero checksum
        assert_eq!(length_checksum(0x088), 0x0088);
        assert_eq!(length_checksum(0xFFFF), length_checksum(0x0FFF));
    }

    #[test]
    fn length_checksum_is_injective() {
        let values: HashSet<u16> = (0..=0x0FFF).map(length_checksum).collect();
        assert_eq!(values.len(), 0x1000);
    }
}
