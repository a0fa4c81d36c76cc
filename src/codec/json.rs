use serde::{Serialize, de::DeserializeOwned};

use super::{CodecError, Serializer};

/// JSON serializer, for peers that want a self-describing wire format.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Serializer for Json {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_string() {
        let codec = Json;
        let bytes = codec.to_bytes(&"hello".to_string()).unwrap();
        assert_eq!(bytes, b"\"hello\"");
        let back: String = codec.from_bytes(&bytes).unwrap();
        assert_eq!(back, "hello");
    }

    #[test]
    fn malformed_json_fails_to_decode() {
        let codec = Json;
        assert!(codec.from_bytes::<String>(b"{not json").is_err());
    }
}
