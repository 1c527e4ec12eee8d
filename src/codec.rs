//! Envelope wire encoding.
//!
//! JSON is the default so that processes written against other clients can
//! share channels; MessagePack (named maps, same keys) is available for
//! fleets that only run this crate.

use crate::error::Result;
use crate::types::Envelope;
use serde::{Deserialize, Serialize};

/// Encoding used for envelopes on the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Msgpack,
}

pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<Vec<u8>> {
    let bytes = match format {
        WireFormat::Json => serde_json::to_vec(envelope)?,
        WireFormat::Msgpack => rmp_serde::to_vec_named(envelope)?,
    };
    Ok(bytes)
}

pub fn decode(payload: &[u8], format: WireFormat) -> Result<Envelope> {
    let envelope = match format {
        WireFormat::Json => serde_json::from_slice(payload)
            .map_err(|e| crate::error::DispatchError::Deserialization(e.to_string()))?,
        WireFormat::Msgpack => rmp_serde::from_slice(payload)?,
    };
    Ok(envelope)
}
