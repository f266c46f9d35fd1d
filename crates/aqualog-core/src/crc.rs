//! CRC32 (ISO-HDLC, the zlib/Ethernet polynomial) used by every persisted
//! structure.

use crc::{CRC_32_ISO_HDLC, Crc};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Size of a stored CRC32 field in bytes.
pub const CRC_FIELD_SIZE: usize = 4;

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC32 over `data` with the four bytes at `field_offset` read as zero.
///
/// This is how self-protecting structures are checked: the checksum is
/// computed with its own field cleared, then stored in that field.
pub fn crc32_with_zeroed_field(data: &[u8], field_offset: usize) -> u32 {
    let start = field_offset.min(data.len());
    let end = (field_offset + CRC_FIELD_SIZE).min(data.len());

    let mut digest = CRC32.digest();
    digest.update(&data[..start]);
    digest.update(&[0u8; CRC_FIELD_SIZE][..end - start]);
    digest.update(&data[end..]);
    digest.finalize()
}
