//! Hex helpers for frame ids and payloads
//!
//! Payloads are shown as spaced uppercase pairs (`"01 02 FF"`) in logs and
//! accepted in either spaced or packed form on input.

use std::fmt::Write;

use errors::{CanError, Result};

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Encode bytes as space separated uppercase pairs
/// Example: [0x01, 0x02, 0xFF] -> "01 02 FF"
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Format a frame identifier: 3 digits for standard ids, 8 for extended
pub fn format_id(id: u32, extended: bool) -> String {
    if extended {
        format!("0x{:08X}", id)
    } else {
        format!("0x{:03X}", id)
    }
}

/// Parse a hex payload, with or without separators
///
/// Whitespace, `:` and `-` are ignored between digit pairs.
pub fn decode(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':' && *b != b'-')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(CanError::parse(format!(
            "odd number of hex digits in '{}'",
            input.trim()
        )));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = nibble(pair[0]);
            let lo = nibble(pair[1]);
            match (hi, lo) {
                (Some(h), Some(l)) => Ok((h << 4) | l),
                _ => Err(CanError::parse(format!(
                    "invalid hex byte '{}{}'",
                    pair[0] as char, pair[1] as char
                ))),
            }
        })
        .collect()
}

/// Parse a frame id written as `0x1A0`, `1A0h` or plain hex
pub fn parse_id(input: &str) -> Result<u32> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .or_else(|| trimmed.strip_suffix('h'))
        .or_else(|| trimmed.strip_suffix('H'))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .map_err(|e| CanError::parse(format!("invalid frame id '{}': {}", trimmed, e)))
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x12, 0x34, 0xAB]), "1234AB");
        assert_eq!(encode_upper(&[]), "");
    }

    #[test]
    fn test_encode_spaced() {
        assert_eq!(encode_spaced(&[0x01, 0x02, 0xFF]), "01 02 FF");
        assert_eq!(encode_spaced(&[0x14]), "14");
        assert_eq!(encode_spaced(&[]), "");
    }

    #[test]
    fn test_format_id() {
        assert_eq!(format_id(0x100, false), "0x100");
        assert_eq!(format_id(0x7FF, false), "0x7FF");
        assert_eq!(format_id(0x800, true), "0x00000800");
    }

    #[test]
    fn test_decode_spaced_and_packed() {
        assert_eq!(decode("01 02 ff").unwrap(), vec![0x01, 0x02, 0xFF]);
        assert_eq!(decode("0102FF").unwrap(), vec![0x01, 0x02, 0xFF]);
        assert_eq!(decode("01:02-FF").unwrap(), vec![0x01, 0x02, 0xFF]);
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode("0").is_err());
        assert!(decode("zz").is_err());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0x100").unwrap(), 0x100);
        assert_eq!(parse_id("7FFh").unwrap(), 0x7FF);
        assert_eq!(parse_id("18FEF100").unwrap(), 0x18FE_F100);
        assert!(parse_id("0xG1").is_err());
    }
}
