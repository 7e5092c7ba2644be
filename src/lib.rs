// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! langfleet drives several language servers as one fleet.
//!
//! Each backend gets a [`lsp::Client`] that owns its request lifecycle, and a
//! single [`lsp::ClientManager`] restarts crashed backends after a backoff,
//! fans requests out to every ready backend, and shuts the fleet down within
//! a bounded time.

/// Command-line interface definitions and utilities.
pub mod cli;
/// Configuration handling for language servers and lifecycle timing.
pub mod config;
/// LSP client implementation and fleet management.
pub mod lsp;
