//! CBOR encoding helpers.

use crate::error::{TypesError, TypesResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Types that can be written to CBOR.
pub trait Encode {
    /// Encodes this value to CBOR bytes.
    fn encode(&self) -> TypesResult<Vec<u8>>;
}

/// Types that can be read back from CBOR.
pub trait Decode: Sized {
    /// Decodes a value from CBOR bytes.
    fn decode(bytes: &[u8]) -> TypesResult<Self>;
}

impl<T: Serialize> Encode for T {
    fn encode(&self) -> TypesResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> TypesResult<Self> {
        from_cbor(bytes)
    }
}

/// Encodes any serializable value to CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> TypesResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| TypesError::encoding_failed(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> TypesResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| TypesError::decoding_failed(e.to_string()))
}
