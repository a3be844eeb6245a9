//! Whole-message MessagePack decoding.
//!
//! Enabled explicitly per run; unmarshals the value as a generic map and
//! re-encodes it as canonical JSON text. serde_json's object representation
//! is backed by a BTreeMap, so keys come out sorted.

use crate::error::{Error, Result};

/// Decode a MessagePack payload into canonical key-ordered JSON text.
pub fn decode_to_json(payload: &[u8]) -> Result<String> {
    let value: serde_json::Value =
        rmp_serde::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))?;
    serde_json::to_string(&value).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_map_sorted_keys() {
        let value = serde_json::json!({"zebra": 1, "alpha": {"b": true, "a": "x"}});
        let packed = rmp_serde::to_vec(&value).unwrap();
        let json = decode_to_json(&packed).unwrap();
        assert_eq!(json, r#"{"alpha":{"a":"x","b":true},"zebra":1}"#);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_to_json(&[0xc1]).is_err());
    }
}
