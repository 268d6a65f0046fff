//! Payload codec.
//!
//! Payloads are stored as opaque JSON strings. Any reversible string codec
//! would do; JSON keeps payloads inspectable in the backing store.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::InboxError;

pub fn encode<T: Serialize>(value: &T) -> Result<String, InboxError> {
    serde_json::to_string(value).map_err(|e| InboxError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(payload)
}
