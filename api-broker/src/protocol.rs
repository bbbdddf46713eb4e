//! Request and response payload layout.
//!
//! Requests start with a four byte header `version | service | action | flags`;
//! when bit 0 of `flags` is set, a 32 byte correlation hash follows. Responses
//! are `version | code | hash_len | hash | error_len | error | body`.
//!
//! The broker itself only needs the service byte (to steer heartbeats) and
//! the response encoders for pushes it originates: transaction callbacks,
//! event batches and heartbeat acknowledgements.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::filter::ContractEvent;
use crate::pending::PendingTxResult;

pub const API_VERSION: u8 = 2;
pub const REQUEST_HEADER_LEN: usize = 4;
pub const HASH_LEN: usize = 32;

const FLAG_HASH: u8 = 0x01;

pub mod service {
    pub const ECHO: u8 = 1;
    pub const EVENTS: u8 = 2;
    pub const TX: u8 = 3;
    pub const HEARTBEAT: u8 = 7;
}

pub mod code {
    pub const SUCCESS: u8 = 1;
    pub const BAD_REQUEST: u8 = 2;
    pub const UNSUPPORTED: u8 = 3;
    pub const INTERNAL: u8 = 4;
    pub const TX_RECEIVED: u8 = 101;
    pub const TX_DROPPED: u8 = 102;
    pub const TX_NEW_PENDING: u8 = 103;
    pub const TX_INCLUDED: u8 = 104;
    /// Pending status that carries the execution result.
    pub const TX_PENDING: u8 = 105;
    pub const EVENT_CALLBACK: u8 = 110;
    pub const HEARTBEAT: u8 = 111;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes is shorter than its header")]
    Truncated(usize),
    #[error("unsupported api version {0}")]
    Version(u8),
    #[error("error text is not valid utf-8")]
    ErrorText,
    #[error("event batch encoding failed: {0}")]
    Events(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub service: u8,
    pub action: u8,
    pub hash: Option<Bytes>,
}

impl RequestHeader {
    pub fn new(service: u8, action: u8) -> Self {
        Self {
            version: API_VERSION,
            service,
            action,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Bytes) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Splits a request into its header and body.
    pub fn parse(request: &Bytes) -> Result<(Self, Bytes), ProtocolError> {
        if request.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::Truncated(request.len()));
        }
        let version = request[0];
        if version > API_VERSION {
            return Err(ProtocolError::Version(version));
        }

        let mut offset = REQUEST_HEADER_LEN;
        let hash = if request[3] & FLAG_HASH != 0 {
            if request.len() < offset + HASH_LEN {
                return Err(ProtocolError::Truncated(request.len()));
            }
            offset += HASH_LEN;
            Some(request.slice(REQUEST_HEADER_LEN..offset))
        } else {
            None
        };

        let header = Self {
            version,
            service: request[1],
            action: request[2],
            hash,
        };
        Ok((header, request.slice(offset..)))
    }

    pub fn encode(&self, body: &[u8]) -> Bytes {
        let hash_len = self.hash.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + hash_len + body.len());
        buf.put_u8(self.version);
        buf.put_u8(self.service);
        buf.put_u8(self.action);
        buf.put_u8(if self.hash.is_some() { FLAG_HASH } else { 0 });
        if let Some(hash) = &self.hash {
            buf.extend_from_slice(hash);
        }
        buf.extend_from_slice(body);
        buf.freeze()
    }
}

/// True when the payload is addressed to the heartbeat service.
pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[1] == service::HEARTBEAT
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub code: u8,
    pub hash: Option<Bytes>,
    pub error: Option<String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(code: u8) -> Self {
        Self {
            version: API_VERSION,
            code,
            hash: None,
            error: None,
            body: Bytes::new(),
        }
    }

    pub fn with_hash(mut self, hash: Bytes) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn encode(&self) -> Bytes {
        let hash = self.hash.as_deref().unwrap_or_default();
        let hash = &hash[..hash.len().min(u8::MAX as usize)];
        let error = truncate_utf8(self.error.as_deref().unwrap_or_default(), u8::MAX as usize);

        let mut buf = BytesMut::with_capacity(4 + hash.len() + error.len() + self.body.len());
        buf.put_u8(self.version);
        buf.put_u8(self.code);
        buf.put_u8(hash.len() as u8);
        buf.extend_from_slice(hash);
        buf.put_u8(error.len() as u8);
        buf.extend_from_slice(error.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        let truncated = || ProtocolError::Truncated(payload.len());

        let version = *payload.first().ok_or_else(truncated)?;
        let code = *payload.get(1).ok_or_else(truncated)?;
        let hash_len = *payload.get(2).ok_or_else(truncated)? as usize;
        let hash_end = 3 + hash_len;
        let error_len = *payload.get(hash_end).ok_or_else(truncated)? as usize;
        let error_start = hash_end + 1;
        let body_start = error_start + error_len;
        if payload.len() < body_start {
            return Err(truncated());
        }

        let hash = (hash_len > 0).then(|| payload.slice(3..hash_end));
        let error = if error_len > 0 {
            let text = std::str::from_utf8(&payload[error_start..body_start])
                .map_err(|_| ProtocolError::ErrorText)?;
            Some(text.to_string())
        } else {
            None
        };

        Ok(Self {
            version,
            code,
            hash,
            error,
            body: payload.slice(body_start..),
        })
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Fixed reply to every heartbeat probe.
pub fn heartbeat_ack() -> Bytes {
    Response::new(code::HEARTBEAT).encode()
}

/// Formats a transaction callback. Only the pending status carries the
/// execution result; every other status reports hash, code and error.
pub fn tx_status_response(result: &PendingTxResult) -> Bytes {
    let mut response = Response::new(result.status).with_hash(result.msg_hash.clone());
    if let Some(error) = &result.error {
        response = response.with_error(error.clone());
    }
    if result.status == code::TX_PENDING {
        if let Some(body) = &result.result {
            response = response.with_body(body.clone());
        }
    }
    response.encode()
}

/// Encodes a batch of contract events as one callback message.
pub fn event_callback_response(events: &[ContractEvent]) -> Result<Bytes, ProtocolError> {
    let body = bincode::serialize(events).map_err(|err| ProtocolError::Events(err.to_string()))?;
    Ok(Response::new(code::EVENT_CALLBACK)
        .with_body(Bytes::from(body))
        .encode())
}

pub fn decode_event_batch(body: &[u8]) -> Result<Vec<ContractEvent>, ProtocolError> {
    bincode::deserialize(body).map_err(|err| ProtocolError::Events(err.to_string()))
}
