use bincode::config::{BigEndian, Configuration, Fixint};
use serde::{Serialize, de::DeserializeOwned};

use super::{CodecError, Serializer};

/// Compact binary serializer: big-endian, fixed-width integers.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bincode;

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

impl Serializer for Bincode {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serde::encode_to_vec(value, config())?)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, config())?;
        Ok(value)
    }
}
