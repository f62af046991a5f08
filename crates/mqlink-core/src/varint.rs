//! Remaining Length field encoding.
//!
//! The fixed header of every MQTT packet carries the length of the rest of the
//! packet as a variable byte integer: 7 value bits per byte, high bit set when
//! another byte follows, at most four bytes.

use crate::error::{ProtocolError, Result};

/// Largest value a four-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a remaining length from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))`, `Ok(None)` when the field is
/// not complete yet, or an error when a fifth length byte is announced.
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::InvalidRemainingLength.into());
    }
    Ok(None)
}

/// Append `value` as a remaining length.
///
/// Callers check the body size with [`check_len`] first.
pub fn encode(mut value: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Reject packet bodies that cannot be framed.
pub fn check_len(len: usize) -> std::result::Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::MalformedPacket(format!(
            "packet body of {} bytes exceeds the remaining length limit",
            len
        )));
    }
    Ok(())
}
