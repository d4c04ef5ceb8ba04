//! Hex helpers.
//!
//! Numbers in packets (`m1000,4`) are big-endian hex text; binary blobs
//! (memory, register files) are two hex digits per byte in memory order.

use crate::error::{ProtocolError, ProtocolResult};

const DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Value of a single hex digit.
#[must_use]
pub fn nibble(digit: u8) -> Option<u8>
{
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Two lowercase hex digits for `byte`.
#[must_use]
pub fn encode_byte(byte: u8) -> [u8; 2]
{
    [DIGITS[usize::from(byte >> 4)], DIGITS[usize::from(byte & 0x0f)]]
}

/// Hex-encode a byte blob.
#[must_use]
pub fn encode(bytes: &[u8]) -> String
{
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        let [high, low] = encode_byte(byte);
        out.push(char::from(high));
        out.push(char::from(low));
    }
    out
}

/// Decode hex text into bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for odd-length input or non-hex digits.
pub fn decode(text: &[u8]) -> ProtocolResult<Vec<u8>>
{
    if text.len() % 2 != 0 {
        return Err(ProtocolError::Malformed(format!(
            "odd number of hex digits ({})",
            text.len()
        )));
    }
    text.chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(high), Some(low)) => Ok((high << 4) | low),
            _ => Err(ProtocolError::Malformed(format!(
                "invalid hex digits {:?}",
                String::from_utf8_lossy(pair)
            ))),
        })
        .collect()
}

/// Parse a big-endian hex number such as the `1000` in `m1000,4`.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for empty input, non-hex digits or a
/// value wider than 64 bits.
pub fn parse_u64(text: &[u8]) -> ProtocolResult<u64>
{
    if text.is_empty() || text.len() > 16 {
        return Err(ProtocolError::Malformed(format!(
            "invalid hex number {:?}",
            String::from_utf8_lossy(text)
        )));
    }
    text.iter().try_fold(0u64, |value, &digit| {
        nibble(digit).map(|n| (value << 4) | u64::from(n)).ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "invalid hex number {:?}",
                String::from_utf8_lossy(text)
            ))
        })
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_encode_and_decode()
    {
        assert_eq!(encode(&[0x00, 0xcc, 0x7f]), "00cc7f");
        assert_eq!(decode(b"00CC7f").unwrap(), vec![0x00, 0xcc, 0x7f]);
    }

    #[test]
    fn test_decode_rejects_bad_input()
    {
        assert!(decode(b"abc").is_err());
        assert!(decode(b"zz").is_err());
    }

    #[test]
    fn test_parse_u64()
    {
        assert_eq!(parse_u64(b"1000").unwrap(), 0x1000);
        assert_eq!(parse_u64(b"ffffffffffffffff").unwrap(), u64::MAX);
        assert!(parse_u64(b"").is_err());
        assert!(parse_u64(b"1ffffffffffffffff").is_err());
        assert!(parse_u64(b"12g").is_err());
    }
}
