// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// One connection to one language-server backend.
pub mod client;
/// Error types for clients and transports.
pub mod error;
/// Fleet manager: restarts, shutdown and exclusive requests.
pub mod manager;
/// LSP message protocol definitions.
pub mod protocol;
/// Client state and progress tracking.
pub mod state;
/// One-shot timers driven by the manager.
pub mod timers;
/// Byte-stream transports to backend processes.
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{
    Client, ClientEvent, ClientSettings, MessageOutcome, ResponseHandler, ResponseResult,
};
pub use error::{ClientError, TransportError};
pub use manager::{ClientManager, Lifecycle, ManagerEvent};
pub use protocol::{RequestId, ResponseError};
pub use state::{ClientState, ClientStatus};
pub use transport::{ClientId, DeliveryReceiver, DeliverySender, StdioTransport, Transport};
