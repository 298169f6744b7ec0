//! Connection level framing

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{MeshError, MeshResult, Message};

/// Handshake exchanged when a connection opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Member id
    pub id: String,
    /// Address other members should dial
    pub address: String,
    /// Software version
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Frame {
    Hello(Hello),
    Request { correlation: Uuid, message: Message },
    Reply { correlation: Uuid, message: Message },
}

impl Frame {
    pub(crate) fn encode(&self) -> MeshResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| MeshError::Codec(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    pub(crate) fn decode(bytes: &[u8]) -> MeshResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| MeshError::Codec(e.to_string()))
    }
}
