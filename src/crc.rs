//! Header and data checksums of the MS/TP frame format.

use crc::{Algorithm, Crc, CRC_16_IBM_SDLC};

/// Header CRC: x^8 + x^7 + 1, reflected, initial value 0xFF, inverted.
const HEADER_CRC8: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x81,
    init: 0xff,
    refin: true,
    refout: true,
    xorout: 0xff,
    check: 0x89,
    residue: 0x55,
};

static HEADER: Crc<u8> = Crc::<u8>::new(&HEADER_CRC8);

// CRC-CCITT over the data, reflected and inverted (X.25).
static DATA: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// The header CRC as transmitted, computed over type, dest, src and length.
pub fn header_crc(header: &[u8]) -> u8 {
    HEADER.checksum(header)
}

/// The data CRC as transmitted; goes on the wire low byte first.
pub fn data_crc(data: &[u8]) -> u16 {
    DATA.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_crc_vector() {
        // Token from 5 to 16
        assert_eq!(header_crc(&[0x00, 0x10, 0x05, 0x00, 0x00]), 0x8c);
        assert_eq!(header_crc(b"123456789"), 0x89);
    }

    #[test]
    fn test_header_crc_detects_bit_flips() {
        let header = [0x06u8, 0x02, 0x01, 0x00, 0x20];
        let good = header_crc(&header);
        for byte in 0..header.len() {
            for bit in 0..8 {
                let mut bad = header;
                bad[byte] ^= 1 << bit;
                assert_ne!(header_crc(&bad), good);
            }
        }
    }

    #[test]
    fn test_data_crc_vector() {
        let crc = data_crc(&[0x01, 0x22, 0x30]);
        assert_eq!(crc, 0xbd10);
        assert_eq!(crc.to_le_bytes(), [0x10, 0xbd]);
        assert_eq!(data_crc(b"123456789"), 0x906e);
    }

    #[test]
    fn test_empty_data_crc() {
        assert_eq!(data_crc(&[]), 0x0000);
    }
}
