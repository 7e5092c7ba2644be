// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC envelopes and LSP base framing.
//!
//! Frames on the wire look like `Content-Length: N\r\n\r\n<body>`. The decoder
//! works on a growing [`BytesMut`] so a reader can feed it partial chunks.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// JSON-RPC `MethodNotFound`.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC `InternalError`.
pub const INTERNAL_ERROR: i64 = -32603;
/// LSP `RequestCancelled`.
pub const REQUEST_CANCELLED: i64 = -32800;

const JSONRPC_VERSION: &str = "2.0";

/// Largest frame body accepted from a backend.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// A request, sent by either side.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlates the response with this request.
    pub id: RequestId,
    /// Method name, e.g. `initialize`.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl RequestMessage {
    /// Builds a request envelope.
    #[must_use]
    pub fn new(id: RequestId, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// A response to a previously sent request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered. `None` only for parse errors.
    pub id: Option<RequestId>,
    /// Result payload; JSON `null` deserializes to `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    /// Builds a successful response.
    #[must_use]
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message,
                data: None,
            }),
        }
    }

    /// Collapses the envelope into the value a continuation receives.
    ///
    /// A missing result is reported as JSON `null`, which is what servers send
    /// for "no answer".
    pub fn into_result(self) -> Result<serde_json::Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// A message that expects no reply.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name, e.g. `window/logMessage`.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl NotificationMessage {
    /// Builds a notification envelope.
    #[must_use]
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Request identifier; LSP allows integers and strings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, used for ids a client allocates itself.
    Number(i64),
    /// String id, used for ids shared between clients.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human readable description.
    pub message: String,
    /// Optional extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

/// Errors raised while decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The header block was not valid.
    #[error("malformed frame header: {0}")]
    Header(String),
    /// The body was not JSON.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
    /// The body was JSON but not a JSON-RPC message.
    #[error("frame is not a JSON-RPC request, response or notification")]
    Shape,
}

/// One decoded frame, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Has an `id` and no `method`.
    Response(ResponseMessage),
    /// Has both `id` and `method`: the backend is asking us something.
    Request(RequestMessage),
    /// Has a `method` and no `id`.
    Notification(NotificationMessage),
}

impl IncomingMessage {
    /// Decodes and classifies a frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not JSON or does not have the shape of
    /// any JSON-RPC message.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_slice(body)?;

        let has_method = value.get("method").and_then(|m| m.as_str()).is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => Ok(Self::Request(serde_json::from_value(value)?)),
            (true, false) => Ok(Self::Notification(serde_json::from_value(value)?)),
            (false, _) if value.get("result").is_some() || value.get("error").is_some() => {
                Ok(Self::Response(serde_json::from_value(value)?))
            }
            _ => Err(ProtocolError::Shape),
        }
    }
}

/// Serializes a message and prepends the `Content-Length` header.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = BytesMut::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Splits one complete frame body off the front of `buffer`.
///
/// Returns `Ok(None)` until a whole frame has arrived.
///
/// # Errors
///
/// Returns an error if the header block is complete but unusable (not UTF-8,
/// without a valid `Content-Length`, or declaring more than
/// [`MAX_CONTENT_LENGTH`] bytes). The caller decides how to resync.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    let Some(separator) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let headers = std::str::from_utf8(&buffer[..separator])
        .map_err(|e| ProtocolError::Header(e.to_string()))?;

    let mut content_length = None;
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|e| ProtocolError::Header(format!("bad Content-Length: {e}")))?;
            content_length = Some(length);
        }
    }

    let content_length = content_length
        .ok_or_else(|| ProtocolError::Header("missing Content-Length".to_string()))?;

    if content_length > MAX_CONTENT_LENGTH {
        return Err(ProtocolError::Header(format!(
            "Content-Length too large: {content_length}"
        )));
    }

    let header_len = separator + 4;
    let total = header_len
        .checked_add(content_length)
        .ok_or_else(|| ProtocolError::Header("Content-Length too large".to_string()))?;
    if buffer.len() < total {
        return Ok(None);
    }

    buffer.advance(header_len);
    Ok(Some(buffer.split_to(content_length).freeze()))
}
