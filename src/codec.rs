//! Payload codecs.
//!
//! A codec turns a payload value into the bytes kept in a payload map and
//! back. Queues and task engines are generic over the codec so callers can
//! pick a format without touching the store layer.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Converts payload values to and from stored bytes.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
///
/// Stored values stay human readable in `redis-cli`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Stores strings verbatim, without JSON quoting.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<String> for RawCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[test]
    fn test_json_codec_stores_readable_json() {
        let codec = JsonCodec::<Order>::new();
        let order = Order {
            id: 7,
            sku: "A-1".to_string(),
        };

        let bytes = codec.encode(&order).expect("encode should work");
        assert_eq!(bytes, br#"{"id":7,"sku":"A-1"}"#.to_vec());
        assert_eq!(codec.decode(&bytes).expect("decode should work"), order);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec = JsonCodec::<Order>::new();
        assert!(matches!(codec.decode(b"nope"), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_raw_codec_keeps_strings_verbatim() {
        let codec = RawCodec;
        let bytes = codec.encode(&"hello".to_string()).expect("encode should work");
        assert_eq!(bytes, b"hello".to_vec());
        assert!(matches!(codec.decode(&[0xff, 0xfe]), Err(CodecError::Utf8(_))));
    }
}
