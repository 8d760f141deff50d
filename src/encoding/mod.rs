//! On-disk encoding helpers.
//!
//! Two concerns live here: order-preserving key encoding ([`keycode`]) and the
//! length-prefixed, checksummed record framing shared by manifest files, data
//! files, spill runs and the index log.
//!
//! ## Frame format
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! Big-endian lengths and checksums (CRC_32_ISCSI) for cross-platform
//! portability. A clean EOF between frames ends iteration; a checksum
//! mismatch or short read is reported as invalid data and mapped to the
//! corruption error of the containing file kind by the caller.

pub mod keycode;

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Writes one framed payload.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
    Ok(())
}

/// Reads one framed payload. Returns `None` on a clean EOF at a frame
/// boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let stored = reader.read_u32::<BigEndian>()?;
    if CRC32.checksum(&payload) != stored {
        return Err(Error::InvalidData("frame checksum mismatch".to_string()));
    }
    Ok(Some(payload))
}

/// Appends an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint, advancing `pos`.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::InvalidData("truncated varint".to_string()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::InvalidData("varint overflow".to_string()));
        }
    }
}
