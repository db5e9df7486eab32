use crate::PayloadError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request or response payload. The runtime only ever sees the encoded bytes.
///
/// Every serde type is a `Message`, encoded as JSON.
pub trait Message: Sized {
    fn encode_payload(&self) -> Result<Vec<u8>, PayloadError>;
    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadError>;
}

impl<T: Serialize + DeserializeOwned> Message for T {
    fn encode_payload(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Serialize(e.to_string()))
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes).map_err(|e| PayloadError::Deserialize(e.to_string()))
    }
}
