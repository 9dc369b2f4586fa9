//! The DNS-SD TXT record: a key → value-or-flag map, [rfc6763] section 6.
//!
//! [rfc6763]: https://datatracker.ietf.org/doc/html/rfc6763

use crate::errors::{Error, Result};
use std::collections::BTreeMap;

/// TXT keys advertised by an Open Screen receiver.
///
/// `dc` (a CRC-32 of the receiver extra data) is documented by the
/// advertisement schema but is not produced by this implementation.
pub mod keys {
    /// Receiver UUID.
    pub const ID: &str = "id";
    /// Protocol version.
    pub const VERSION: &str = "ve";
    /// Capabilities bitfield.
    pub const CAPABILITIES: &str = "ca";
    /// Status: 0 = idle, 1 = busy.
    pub const STATUS: &str = "st";
    /// Friendly name.
    pub const FRIENDLY_NAME: &str = "fn";
    /// Model name.
    pub const MODEL: &str = "md";
    /// SHA-256 fingerprint of the agent certificate.
    pub const FINGERPRINT: &str = "pk";
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TxtValue {
    Value(Vec<u8>),
    Flag,
}

/// An ordered key → value-or-flag map. Keys are case-insensitive and
/// stored lowercased; flags are boolean-presence entries with no `=`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: BTreeMap<String, TxtValue>,
}

impl TxtRecord {
    pub fn new() -> TxtRecord {
        TxtRecord::default()
    }

    /// Sets `key=value`. Replaces any existing entry for the key. The
    /// whole entry must fit a length-prefixed TXT string (255 bytes).
    pub fn set_value(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = valid_key(key)?;
        let value = value.into();
        if key.len() + 1 + value.len() > 255 {
            return Err(Error::ParameterInvalid(format!(
                "TXT entry '{}' exceeds 255 bytes",
                key
            )));
        }
        self.entries.insert(key, TxtValue::Value(value));
        Ok(())
    }

    /// Sets a boolean-presence flag.
    pub fn set_flag(&mut self, key: &str) -> Result<()> {
        let key = valid_key(key)?;
        self.entries.insert(key, TxtValue::Flag);
        Ok(())
    }

    pub fn value(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(&key.to_ascii_lowercase()) {
            Some(TxtValue::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn has_flag(&self, key: &str) -> bool {
        matches!(
            self.entries.get(&key.to_ascii_lowercase()),
            Some(TxtValue::Flag)
        )
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(&key.to_ascii_lowercase()).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The wire representation: one length-prefixed string per entry,
    /// sorted by key.
    pub fn to_wire(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .map(|(key, value)| match value {
                TxtValue::Flag => key.as_bytes().to_vec(),
                TxtValue::Value(value) => {
                    let mut entry = key.as_bytes().to_vec();
                    entry.push(b'=');
                    entry.extend_from_slice(value);
                    entry
                }
            })
            .collect()
    }

    /// Parses wire-format TXT strings. Entries with invalid keys fail the
    /// whole record; the caller drops it.
    pub fn from_wire(entries: &[Vec<u8>]) -> Result<TxtRecord> {
        let mut record = TxtRecord::new();
        for entry in entries {
            if entry.is_empty() {
                continue;
            }
            match entry.iter().position(|&b| b == b'=') {
                Some(split) => {
                    let key = std::str::from_utf8(&entry[..split]).map_err(|_| {
                        Error::ParameterInvalid("TXT key is not UTF-8".to_string())
                    })?;
                    record.set_value(key, entry[split + 1..].to_vec())?;
                }
                None => {
                    let key = std::str::from_utf8(entry).map_err(|_| {
                        Error::ParameterInvalid("TXT key is not UTF-8".to_string())
                    })?;
                    record.set_flag(key)?;
                }
            }
        }
        Ok(record)
    }
}

fn valid_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::ParameterInvalid("empty TXT key".to_string()));
    }
    // Printable ascii excluding '=', rfc6763 section 6.4.
    if !key
        .bytes()
        .all(|b| (0x20..=0x7E).contains(&b) && b != b'=')
    {
        return Err(Error::ParameterInvalid(format!("invalid TXT key '{}'", key)));
    }
    if key.len() > 63 {
        return Err(Error::ParameterInvalid(format!("TXT key '{}' too long", key)));
    }
    Ok(key.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_and_flag_roundtrip() {
        let mut txt = TxtRecord::new();
        txt.set_value(keys::FRIENDLY_NAME, "Living Room".as_bytes()).unwrap();
        txt.set_flag("bootstrap").unwrap();

        let wire = txt.to_wire();
        assert_eq!(wire, vec![b"bootstrap".to_vec(), b"fn=Living Room".to_vec()]);

        let parsed = TxtRecord::from_wire(&wire).unwrap();
        assert_eq!(parsed, txt);
        assert_eq!(parsed.value("fn"), Some("Living Room".as_bytes()));
        assert!(parsed.has_flag("bootstrap"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut txt = TxtRecord::new();
        txt.set_value("FN", "tv".as_bytes()).unwrap();
        assert_eq!(txt.value("fn"), Some("tv".as_bytes()));
        assert!(txt.remove("Fn"));
        assert!(txt.is_empty());
    }

    #[test]
    fn invalid_keys_rejected() {
        let mut txt = TxtRecord::new();
        assert!(txt.set_value("", "x".as_bytes()).is_err());
        assert!(txt.set_value("a=b", "x".as_bytes()).is_err());
        assert!(txt.set_value("käse", "x".as_bytes()).is_err());
    }

    #[test]
    fn empty_value_is_not_flag() {
        let mut txt = TxtRecord::new();
        txt.set_value("pk", Vec::new()).unwrap();
        assert_eq!(txt.value("pk"), Some(&[] as &[u8]));
        assert!(!txt.has_flag("pk"));
        assert_eq!(txt.to_wire(), vec![b"pk=".to_vec()]);
    }

    #[test]
    fn zero_length_wire_strings_skipped() {
        let parsed = TxtRecord::from_wire(&[Vec::new()]).unwrap();
        assert!(parsed.is_empty());
    }
}
