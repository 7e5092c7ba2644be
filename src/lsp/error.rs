// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use thiserror::Error;

use super::protocol::RequestId;
use super::state::ClientState;

/// Failures of the byte-stream underneath a client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend process could not be launched.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// A stdio pipe was not captured when spawning.
    #[error("{0} of the backend process was not captured")]
    MissingPipe(&'static str),
    /// `send` was called before `start`.
    #[error("transport has not been started")]
    NotStarted,
    /// The stream is closed and cannot be written.
    #[error("transport is closed")]
    Closed,
}

/// Errors returned by [`Client`](super::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation is not allowed in the client's current state.
    #[error("`{client}` cannot {operation} while {state}")]
    InvalidState {
        /// Display name of the client.
        client: String,
        /// The rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: ClientState,
    },
    /// The id is already waiting for a response.
    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),
    /// The transport rejected the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
