// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! CLI utilities for terminal output formatting and colors.

use crossterm::tty::IsTty;
use lsp_types::ServerCapabilities;
use std::io::stdout;

/// Configuration for color output
#[derive(Debug, Clone, Copy)]
pub struct ColorConfig {
    /// Whether ANSI escapes are emitted.
    pub enabled: bool,
}

impl ColorConfig {
    /// Create a new `ColorConfig`, auto-detecting TTY unless nocolor is true
    #[must_use]
    pub fn new(nocolor: bool) -> Self {
        Self {
            enabled: !nocolor && stdout().is_tty(),
        }
    }

    fn paint(self, code: &str, s: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    /// Green (ready servers)
    #[must_use]
    pub fn green(self, s: &str) -> String {
        self.paint("32", s)
    }

    /// Yellow (servers still starting or restarting)
    #[must_use]
    pub fn yellow(self, s: &str) -> String {
        self.paint("33", s)
    }

    /// Red (errors)
    #[must_use]
    pub fn red(self, s: &str) -> String {
        self.paint("31", s)
    }

    /// Dim text
    #[must_use]
    pub fn dim(self, s: &str) -> String {
        self.paint("2", s)
    }

    /// Bold text
    #[must_use]
    pub fn bold(self, s: &str) -> String {
        self.paint("1", s)
    }
}

/// Get the terminal width, defaulting to 80 if unable to detect
#[must_use]
pub fn terminal_width() -> usize {
    crossterm::terminal::size().map_or(80, |(w, _)| usize::from(w))
}

/// Truncate a string to `max_len` characters, adding "..." if truncated
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return ".".repeat(max_len);
    }
    let kept: String = s.chars().take(max_len - 3).collect();
    format!("{kept}...")
}

/// Short names of the request kinds a server advertises.
#[must_use]
pub fn capability_names(caps: &ServerCapabilities) -> Vec<&'static str> {
    let mut names = Vec::new();
    if caps.hover_provider.is_some() {
        names.push("hover");
    }
    if caps.definition_provider.is_some() {
        names.push("definition");
    }
    if caps.type_definition_provider.is_some() {
        names.push("type-definition");
    }
    if caps.implementation_provider.is_some() {
        names.push("implementation");
    }
    if caps.references_provider.is_some() {
        names.push("references");
    }
    if caps.document_symbol_provider.is_some() {
        names.push("document-symbols");
    }
    if caps.workspace_symbol_provider.is_some() {
        names.push("workspace-symbols");
    }
    if caps.rename_provider.is_some() {
        names.push("rename");
    }
    if caps.code_action_provider.is_some() {
        names.push("code-actions");
    }
    if caps.call_hierarchy_provider.is_some() {
        names.push("call-hierarchy");
    }
    if caps.diagnostic_provider.is_some() {
        names.push("diagnostics");
    }
    names
}
