//! Record encoding for the topology store.
//!
//! Records are MessagePack maps (field names included) so that adding a field
//! with `#[serde(default)]` keeps older records readable.

use crate::core::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(contents: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(contents)?)
}
