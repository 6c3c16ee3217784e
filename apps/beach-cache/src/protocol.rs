//! Peer wire format: `POST /peer/get` with a JSON [`GetRequest`], answered by
//! a [`GetResponse`] on success or an [`ErrorResponse`] with a non-2xx status.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const PEER_GET_PATH: &str = "/peer/get";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub group: String,
    pub key: String,
}

/// Value bytes, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: String,
}

impl GetResponse {
    pub fn encode(value: &[u8]) -> Self {
        Self {
            value: STANDARD.encode(value),
        }
    }

    pub fn decode(&self) -> Result<Bytes, base64::DecodeError> {
        STANDARD.decode(&self.value).map(Bytes::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
