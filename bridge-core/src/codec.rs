//! Value serialization and the binary entry envelope.
//!
//! Every tier stores opaque bytes. A [`Serializer`] turns domain values into
//! those bytes; the envelope functions pack an [`Entry`]'s metadata next to
//! its value for backends that only hold a single byte string per key.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::{Entry, Version};
use crate::error::CodecError;
use crate::key::Key;

/// Converts domain values to and from the bytes held by tiers.
pub trait Serializer: Send + Sync + 'static {
    /// Short format name for error messages.
    fn format(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            format: self.format().to_string(),
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            format: self.format().to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn format(&self) -> &'static str {
        "yaml"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| CodecError::Encode {
                format: self.format().to_string(),
                reason: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_yaml::from_slice(bytes).map_err(|e| CodecError::Decode {
            format: self.format().to_string(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// ENTRY ENVELOPE
// ============================================================================

const ENVELOPE_MAGIC: u8 = 0xB7;
const FLAG_TOMBSTONE: u8 = 0b01;
const FLAG_EXPIRY: u8 = 0b10;
const HEADER_LEN: usize = 1 + 1 + 8;

/// Pack an entry as `[magic][flags][version: u64 BE][expiry: i64 BE micros]?[value]`.
pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut flags = 0u8;
    if entry.tombstone {
        flags |= FLAG_TOMBSTONE;
    }
    if entry.expires_at.is_some() {
        flags |= FLAG_EXPIRY;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + 8 + entry.value.len());
    out.push(ENVELOPE_MAGIC);
    out.push(flags);
    out.extend_from_slice(&entry.version.get().to_be_bytes());
    if let Some(at) = entry.expires_at {
        out.extend_from_slice(&at.timestamp_micros().to_be_bytes());
    }
    out.extend_from_slice(&entry.value);
    out
}

/// Unpack an envelope produced by [`encode_entry`].
pub fn decode_entry(key: Key, bytes: &[u8]) -> Result<Entry, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::CorruptEnvelope {
            reason: format!("{} bytes is shorter than the header", bytes.len()),
        });
    }
    if bytes[0] != ENVELOPE_MAGIC {
        return Err(CodecError::CorruptEnvelope {
            reason: format!("bad magic byte 0x{:02x}", bytes[0]),
        });
    }
    let flags = bytes[1];
    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&bytes[2..10]);
    let version = Version::new(u64::from_be_bytes(version_bytes));

    let mut offset = HEADER_LEN;
    let expires_at = if flags & FLAG_EXPIRY != 0 {
        if bytes.len() < offset + 8 {
            return Err(CodecError::CorruptEnvelope {
                reason: "expiry flag set but timestamp missing".to_string(),
            });
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[offset..offset + 8]);
        offset += 8;
        let micros = i64::from_be_bytes(ts);
        Some(
            DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                CodecError::CorruptEnvelope {
                    reason: format!("expiry {} out of range", micros),
                }
            })?,
        )
    } else {
        None
    };

    Ok(Entry {
        key,
        value: bytes[offset..].to_vec(),
        version,
        expires_at,
        origin: None,
        tombstone: flags & FLAG_TOMBSTONE != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        n: String,
        age: u32,
    }

    #[test]
    fn test_json_serializer() {
        let user = User {
            n: "a".to_string(),
            age: 3,
        };
        let bytes = JsonSerializer.encode(&user).unwrap();
        assert_eq!(bytes, br#"{"n":"a","age":3}"#.to_vec());
        let back: User = JsonSerializer.decode(&bytes).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_yaml_serializer() {
        let user = User {
            n: "b".to_string(),
            age: 9,
        };
        let bytes = YamlSerializer.encode(&user).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("n: b"));
        let back: User = YamlSerializer.decode(&bytes).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_decode_error_names_format() {
        let err = JsonSerializer.decode::<User>(b"not json").unwrap_err();
        assert!(err.to_string().contains("json"));
    }

    #[test]
    fn test_envelope_preserves_metadata() {
        let entry = Entry::new(Key::from("k"), b"payload".to_vec(), Version::new(42))
            .with_ttl(Some(Duration::from_secs(60)));
        let decoded = decode_entry(Key::from("k"), &encode_entry(&entry)).unwrap();
        assert_eq!(decoded.version, Version::new(42));
        assert_eq!(decoded.value, b"payload");
        assert!(!decoded.tombstone);
        assert_eq!(
            decoded.expires_at.map(|t| t.timestamp_micros()),
            entry.expires_at.map(|t| t.timestamp_micros())
        );
    }

    #[test]
    fn test_envelope_tombstone_without_expiry() {
        let mut entry = Entry::tombstone(Key::from("gone"), Duration::from_secs(1));
        entry.expires_at = None;
        let bytes = encode_entry(&entry);
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = decode_entry(Key::from("gone"), &bytes).unwrap();
        assert!(decoded.tombstone);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn test_corrupt_envelopes_rejected() {
        assert!(decode_entry(Key::from("k"), &[ENVELOPE_MAGIC]).is_err());
        assert!(decode_entry(Key::from("k"), &[0u8; 12]).is_err());

        let mut truncated = vec![ENVELOPE_MAGIC, FLAG_EXPIRY];
        truncated.extend_from_slice(&1u64.to_be_bytes());
        truncated.extend_from_slice(&[1, 2, 3]);
        assert!(decode_entry(Key::from("k"), &truncated).is_err());
    }
}
