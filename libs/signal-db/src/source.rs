//! Loading a database from raw bytes
//!
//! DBC files in the field come in several text encodings. Each candidate is
//! tried in a fixed order and the first one that both decodes and parses
//! wins.

use std::path::Path;

use encoding_rs::{Encoding, GBK, UTF_8, WINDOWS_1252};
use errors::{CanError, Result};
use tracing::{debug, info};

use crate::dbc;
use crate::model::Database;

/// Bytes with no mapping in Windows-1252
const CP1252_UNDEFINED: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

/// Candidate encodings, in the order they are tried
pub fn candidate_encodings() -> [&'static Encoding; 3] {
    [UTF_8, WINDOWS_1252, GBK]
}

/// Strict decode: `None` when `bytes` is not valid in `encoding`
fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    // WHATWG maps the holes of cp1252 to C1 controls; treat them as invalid
    if encoding == WINDOWS_1252 && bytes.iter().any(|b| CP1252_UNDEFINED.contains(b)) {
        return None;
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

impl Database {
    /// Parse DBC text that is already decoded
    pub fn from_dbc_str(text: &str) -> Result<Self> {
        dbc::parse(text)
    }

    /// Decode and parse DBC bytes
    ///
    /// Returns the parse error of the last encoding that decoded, or a
    /// `Parse` error when no candidate could decode the input.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let mut last_error = None;

        for encoding in candidate_encodings() {
            let Some(text) = decode_strict(encoding, bytes) else {
                debug!("Source is not valid {}", encoding.name());
                continue;
            };

            match dbc::parse(&text) {
                Ok(db) => {
                    debug!("Parsed database as {}", encoding.name());
                    return Ok(db);
                },
                Err(e) => {
                    debug!("Parse as {} failed: {}", encoding.name(), e);
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CanError::parse("source is not valid UTF-8, Windows-1252 or GBK text")
        }))
    }

    /// Read a DBC file from disk
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let db = Self::load(&bytes)?;
        info!("Loaded {} messages from {}", db.len(), path.display());
        Ok(db)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order() {
        let names: Vec<_> = candidate_encodings().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["UTF-8", "windows-1252", "GBK"]);
    }

    #[test]
    fn test_cp1252_holes_are_rejected() {
        assert!(decode_strict(WINDOWS_1252, &[0x41, 0x81]).is_none());
        assert_eq!(decode_strict(WINDOWS_1252, &[0x41, 0xE9]).unwrap(), "Aé");
    }

    #[test]
    fn test_utf8_with_bom() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(b"BO_ 1 A: 8 ECU\n");
        let db = Database::load(&bytes).unwrap();
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_latin1_comment() {
        // "Température" in Windows-1252
        let mut bytes = b"BO_ 1 A: 8 ECU\nCM_ BO_ 1 \"Temp".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"rature\";\n");

        let db = Database::load(&bytes).unwrap();
        let message = db.get_message_by_id(1).unwrap();
        assert_eq!(message.comment.as_deref(), Some("Température"));
    }

    #[test]
    fn test_gbk_comment() {
        let (encoded, _, _) = GBK.encode("丂发动机");
        // 0x81 lead byte (GBK extension) is a cp1252 hole, so UTF-8 and
        // cp1252 both fail before GBK is tried
        assert!(encoded.iter().any(|b| CP1252_UNDEFINED.contains(b)));

        let mut bytes = b"BO_ 1 A: 8 ECU\nCM_ BO_ 1 \"".to_vec();
        bytes.extend_from_slice(&encoded);
        bytes.extend_from_slice(b"\";\n");

        let db = Database::load(&bytes).unwrap();
        let message = db.get_message_by_id(1).unwrap();
        assert_eq!(message.comment.as_deref(), Some("丂发动机"));
    }

    #[test]
    fn test_parse_error_survives_all_encodings() {
        let err = Database::load(b"BO_ oops").unwrap_err();
        assert_eq!(err.error_code(), "PARSE_ERROR");
    }

    #[test]
    fn test_load_file_missing() {
        let err = Database::load_file("/nonexistent/file.dbc").unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}
