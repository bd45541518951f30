//! Deterministic byte encoding.
//!
//! Every value that is hashed or signed goes through [`canonical_bytes`]. The
//! encoding is JSON over structs with a fixed field order and no maps keyed by
//! non-deterministic iteration order, so identical content always produces
//! identical bytes.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encodes `value` into its canonical byte form.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// An opaque serialized value whose exact bytes matter, e.g. because they are signed.
///
/// Serialized as a hex string so the bytes survive re-encoding untouched.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SerializedBytes(Vec<u8>);

impl SerializedBytes {
    /// Canonically serializes `value`.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        canonical_bytes(value).map(Self)
    }

    /// Wraps raw bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the bytes back into a value.
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

impl fmt::Debug for SerializedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerializedBytes({} bytes)", self.0.len())
    }
}

impl Serialize for SerializedBytes {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(&self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for SerializedBytes {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(&s).map(Self).map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer).map(Self)
        }
    }
}
