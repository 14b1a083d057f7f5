//! Node-metadata dictionary codec.
//!
//! A dictionary is a flat map of string keys to binary values, serialized as
//! `key=value` lines. Values may contain arbitrary bytes; the line
//! delimiters, `=`, backslash, CR, and NUL are escaped. Encoding is
//! deterministic (keys in sorted order) so two encodings of the same map are
//! byte-identical.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DictionaryError {
    #[error("dictionary key contains reserved characters")]
    InvalidKey,
    #[error("dictionary key is not valid UTF-8")]
    KeyNotUtf8,
    #[error("dictionary value ends mid-escape")]
    TruncatedEscape,
    #[error("unknown escape sequence in dictionary value")]
    BadEscape,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Insert a value. Returns an error if the key contains characters used
    /// by the wire syntax.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), DictionaryError> {
        let key = key.into();
        if key.is_empty() || key.bytes().any(|b| matches!(b, b'=' | b'\n' | b'\r' | 0)) {
            return Err(DictionaryError::InvalidKey);
        }
        self.entries.insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            for &b in value {
                match b {
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    b'=' => out.extend_from_slice(b"\\e"),
                    0 => out.extend_from_slice(b"\\0"),
                    other => out.push(other),
                }
            }
            out.push(b'\n');
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DictionaryError> {
        let mut dict = Dictionary::new();
        for line in data.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let eq = line
                .iter()
                .position(|&b| b == b'=')
                .ok_or(DictionaryError::InvalidKey)?;
            let key = std::str::from_utf8(&line[..eq])
                .map_err(|_| DictionaryError::KeyNotUtf8)?
                .to_string();

            let mut value = Vec::new();
            let mut bytes = line[eq + 1..].iter();
            while let Some(&b) = bytes.next() {
                if b != b'\\' {
                    value.push(b);
                    continue;
                }
                match bytes.next() {
                    Some(b'\\') => value.push(b'\\'),
                    Some(b'n') => value.push(b'\n'),
                    Some(b'r') => value.push(b'\r'),
                    Some(b'e') => value.push(b'='),
                    Some(b'0') => value.push(0),
                    Some(_) => return Err(DictionaryError::BadEscape),
                    None => return Err(DictionaryError::TruncatedEscape),
                }
            }
            dict.set(key, value)?;
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_escapes() {
        let mut dict = Dictionary::new();
        dict.set("version", b"1.0".to_vec()).expect("set");
        dict.set("blob", vec![0u8, b'=', b'\n', b'\\', 0xfe])
            .expect("set");
        let encoded = dict.encode();
        let decoded = Dictionary::decode(&encoded).expect("decode");
        assert_eq!(decoded, dict);
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut a = Dictionary::new();
        a.set("b", b"2".to_vec()).expect("set");
        a.set("a", b"1".to_vec()).expect("set");
        let mut b = Dictionary::new();
        b.set("a", b"1".to_vec()).expect("set");
        b.set("b", b"2".to_vec()).expect("set");
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn rejects_reserved_key_characters() {
        let mut dict = Dictionary::new();
        assert_eq!(
            dict.set("bad=key", b"".to_vec()),
            Err(DictionaryError::InvalidKey)
        );
        assert_eq!(dict.set("", b"".to_vec()), Err(DictionaryError::InvalidKey));
    }

    #[test]
    fn rejects_malformed_escapes() {
        assert_eq!(
            Dictionary::decode(b"k=a\\q\n"),
            Err(DictionaryError::BadEscape)
        );
        assert_eq!(
            Dictionary::decode(b"k=a\\"),
            Err(DictionaryError::TruncatedEscape)
        );
    }

    #[test]
    fn empty_dictionary_encodes_empty() {
        assert!(Dictionary::new().encode().is_empty());
        assert!(Dictionary::decode(b"").expect("decode").is_empty());
    }
}
