// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::lsp::Lifecycle;
use crate::lsp::client::DEFAULT_RESTART_BUDGET;

const DEFAULT_RESTART_BACKOFF_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 3;

/// Fleet configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Seconds to wait before restarting a backend that died (default: 5)
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,

    /// Seconds a graceful shutdown may take before backends are dropped (default: 3)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Automatic restarts allowed per backend (default: 5)
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,

    /// Server definitions keyed by display name (e.g., "rust", "clangd")
    #[serde(default)]
    pub server: BTreeMap<String, ServerConfig>,
}

/// How to launch one backend.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// The command to execute (e.g., "rust-analyzer")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Initialization options to pass to the LSP server
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

const fn default_restart_backoff() -> u64 {
    DEFAULT_RESTART_BACKOFF_SECS
}

const fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

const fn default_restart_budget() -> u32 {
    DEFAULT_RESTART_BUDGET
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not match the
    /// expected shape.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("restart_backoff_secs", DEFAULT_RESTART_BACKOFF_SECS)?
            .set_default("shutdown_timeout_secs", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?
            .set_default("restart_budget", DEFAULT_RESTART_BUDGET)?;

        // 2. Load from user config directory (~/.config/langfleet/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("langfleet").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (LANGFLEET_RESTART_BUDGET, etc.)
        builder = builder.add_source(config::Environment::with_prefix("LANGFLEET").try_parsing(true));

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Adds or replaces a server from a `name:command args...` spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec has no `:` or an empty command.
    pub fn add_server_spec(&mut self, spec: &str) -> Result<()> {
        let (name, command_str) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid LSP spec: {spec}. Expected 'name:command'"))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("Invalid LSP spec: {spec}. Name cannot be empty"));
        }

        let mut parts = command_str.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("command cannot be empty"))?
            .to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        self.server.insert(
            name.to_string(),
            ServerConfig {
                command: program,
                args,
                initialization_options: None,
            },
        );
        Ok(())
    }

    /// Restart and shutdown timing for the manager.
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            restart_backoff: Duration::from_secs(self.restart_backoff_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart_backoff_secs: DEFAULT_RESTART_BACKOFF_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            restart_budget: DEFAULT_RESTART_BUDGET,
            server: BTreeMap::new(),
        }
    }
}
