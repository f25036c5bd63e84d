//! The store treats `args`, `kwargs`, `trigger` state, `return_value`, and
//! `exception` as opaque byte strings produced by an injected serializer.
//! Implementations must not assume a particular wire format, but the *same*
//! serializer has to be configured across every participant sharing a store.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{DeserializationError, SerializationError};

pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DeserializationError>;
}

/// Default serializer backing both shipped stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DeserializationError> {
        serde_json::from_slice(bytes).map_err(|e| DeserializationError(e.to_string()))
    }
}
