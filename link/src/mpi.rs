//! Length-prefixed big-endian integers.
//!
//! Each value is written as a 2-byte big-endian bit length followed by the minimal big-endian
//! magnitude. Every field in the handshake has a known width, so decoding always targets a
//! fixed-size array (left-padded with zeros) and rejects values wider than that array.

use crate::Error;

/// Size of the bit-length prefix (in bytes).
pub const PREFIX_LENGTH: usize = 2;

/// Append the encoding of `value` (interpreted as a big-endian integer) to `buf`.
pub fn encode(value: &[u8], buf: &mut Vec<u8>) {
    let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let magnitude = &value[start..];
    let bits = match magnitude.first() {
        Some(first) => (magnitude.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
        None => 0,
    };
    debug_assert!(bits <= u16::MAX as usize);
    buf.extend_from_slice(&(bits as u16).to_be_bytes());
    buf.extend_from_slice(magnitude);
}

/// Number of bytes in an encoded value (prefix included).
pub fn encoded_len(value: &[u8]) -> usize {
    let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    PREFIX_LENGTH + value.len() - start
}

/// Parse a prefix, returning the number of magnitude bytes that follow it.
///
/// Values wider than `N` bytes are rejected before any magnitude is read.
pub fn magnitude_len<const N: usize>(prefix: [u8; PREFIX_LENGTH]) -> Result<usize, Error> {
    let bits = u16::from_be_bytes(prefix) as usize;
    if bits > N * 8 {
        return Err(Error::NegotiationFailed("integer too large"));
    }
    Ok(bits.div_ceil(8))
}

/// Decode a magnitude (as announced by `prefix`) into a fixed-width array.
pub fn decode<const N: usize>(
    prefix: [u8; PREFIX_LENGTH],
    magnitude: &[u8],
) -> Result<[u8; N], Error> {
    let len = magnitude_len::<N>(prefix)?;
    if magnitude.len() != len {
        return Err(Error::NegotiationFailed("integer length mismatch"));
    }

    // Leading zero bytes (or an overstated bit length) would give one value two encodings
    if let Some(first) = magnitude.first() {
        let bits = (len - 1) * 8 + (8 - first.leading_zeros() as usize);
        if bits != u16::from_be_bytes(prefix) as usize {
            return Err(Error::NegotiationFailed("non-canonical integer"));
        }
    }

    let mut value = [0u8; N];
    value[N - len..].copy_from_slice(magnitude);
    Ok(value)
}
