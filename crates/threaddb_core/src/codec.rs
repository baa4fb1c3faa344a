//! CBOR helpers for values persisted in the datastore.
//!
//! Everything written below `meta/`, `eventbus/` and `dispatcher/` is CBOR.
//! Instances themselves are stored as JSON so they stay readable with
//! ordinary tooling.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| CoreError::codec(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(format!("cbor decode: {e}")))
}

/// Encodes a JSON value as bytes.
pub fn to_json(value: &serde_json::Value) -> CoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes JSON bytes.
pub fn from_json(bytes: &[u8]) -> CoreResult<serde_json::Value> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        thread_id: String,
        body: Vec<u8>,
    }

    #[test]
    fn cbor_struct() {
        let job = Job {
            thread_id: "abc".into(),
            body: vec![1, 2, 3],
        };
        let bytes = to_cbor(&job).unwrap();
        assert_eq!(from_cbor::<Job>(&bytes).unwrap(), job);
    }

    #[test]
    fn cbor_json_value() {
        let schema = json!({"type": "object", "properties": {"age": {"type": "integer"}}});
        let bytes = to_cbor(&schema).unwrap();
        assert_eq!(from_cbor::<serde_json::Value>(&bytes).unwrap(), schema);
    }

    #[test]
    fn garbage_is_codec_error() {
        let err = from_cbor::<Job>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
        assert!(from_json(b"{not json").is_err());
    }
}
