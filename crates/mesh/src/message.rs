//! Typed messages exchanged between members

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message type discriminator
pub type ContentType = u32;

/// Header key
pub type HeaderKey = u32;

/// Reply sent by the mesh itself when a request could not be routed; the
/// body is a UTF-8 description
pub const CONTENT_TYPE_MESH_ERROR: ContentType = 1;

/// A content-type tagged payload with integer keyed headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What the body holds
    pub content_type: ContentType,
    /// Headers
    pub headers: BTreeMap<HeaderKey, Bytes>,
    /// Payload
    pub body: Bytes,
}

impl Message {
    /// Create a message without headers
    pub fn new(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a raw header
    pub fn with_header(mut self, key: HeaderKey, value: impl Into<Bytes>) -> Self {
        self.headers.insert(key, value.into());
        self
    }

    /// Add a big-endian `u64` header
    pub fn with_u64_header(self, key: HeaderKey, value: u64) -> Self {
        self.with_header(key, value.to_be_bytes().to_vec())
    }

    /// Add a big-endian `u32` header
    pub fn with_u32_header(self, key: HeaderKey, value: u32) -> Self {
        self.with_header(key, value.to_be_bytes().to_vec())
    }

    /// Raw header value
    pub fn header(&self, key: HeaderKey) -> Option<&Bytes> {
        self.headers.get(&key)
    }

    /// `u64` header; `None` when absent or not eight bytes wide
    pub fn u64_header(&self, key: HeaderKey) -> Option<u64> {
        let bytes: [u8; 8] = self.header(key)?.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// `u32` header; `None` when absent or not four bytes wide
    pub fn u32_header(&self, key: HeaderKey) -> Option<u32> {
        let bytes: [u8; 4] = self.header(key)?.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Body as lossy UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub(crate) fn mesh_error(reason: impl Into<String>) -> Self {
        Self::new(CONTENT_TYPE_MESH_ERROR, reason.into())
    }
}
