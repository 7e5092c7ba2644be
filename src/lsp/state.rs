// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Client lifecycle state and work-done progress tracking.

use lsp_types::{NumberOrString, ProgressParams, ProgressParamsValue, WorkDoneProgress};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of one backend connection.
///
/// States only move forward; `Error` is terminal until the client is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Constructed or reset, no traffic sent yet.
    Uninitialized,
    /// `initialize` is in flight.
    InitializeRequested,
    /// Handshake completed; the client accepts requests.
    Initialized,
    /// `shutdown` is in flight.
    ShutdownRequested,
    /// The backend acknowledged `shutdown`.
    Shutdown,
    /// Transport failure or rejected handshake.
    Error,
}

impl ClientState {
    /// Whether requests may be routed to a client in this state.
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Initialized)
    }

    /// Whether the client is finishing because it was asked to.
    #[must_use]
    pub const fn is_deliberate_shutdown(self) -> bool {
        matches!(self, Self::ShutdownRequested | Self::Shutdown)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::InitializeRequested => 1,
            Self::Initialized => 2,
            Self::ShutdownRequested => 3,
            Self::Shutdown => 4,
            Self::Error => 5,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Error, _) => false,
            (_, Self::Error) => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::InitializeRequested => "initializing",
            Self::Initialized => "ready",
            Self::ShutdownRequested => "shutting down",
            Self::Shutdown => "shut down",
            Self::Error => "failed",
        };
        f.write_str(name)
    }
}

/// One running `$/progress` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkProgress {
    /// Title from the `begin` report.
    pub title: String,
    /// Latest message.
    pub message: Option<String>,
    /// Latest percentage.
    pub percentage: Option<u32>,
}

/// What a progress notification did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressChange {
    /// A new operation started.
    Began(String),
    /// An operation reported progress.
    Reported(String),
    /// An operation finished.
    Ended(String),
    /// Report or end for a token that never began.
    Unknown,
}

/// Work-done progress reported by one backend, keyed by token.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    operations: BTreeMap<String, WorkProgress>,
}

fn token_key(token: &NumberOrString) -> String {
    match token {
        NumberOrString::Number(n) => n.to_string(),
        NumberOrString::String(s) => s.clone(),
    }
}

impl ProgressTracker {
    /// Applies a `$/progress` notification.
    pub fn apply(&mut self, params: &ProgressParams) -> ProgressChange {
        let key = token_key(&params.token);
        let ProgressParamsValue::WorkDone(progress) = &params.value;

        match progress {
            WorkDoneProgress::Begin(begin) => {
                self.operations.insert(
                    key,
                    WorkProgress {
                        title: begin.title.clone(),
                        message: begin.message.clone(),
                        percentage: begin.percentage,
                    },
                );
                ProgressChange::Began(begin.title.clone())
            }
            WorkDoneProgress::Report(report) => {
                let Some(operation) = self.operations.get_mut(&key) else {
                    return ProgressChange::Unknown;
                };
                if report.message.is_some() {
                    operation.message.clone_from(&report.message);
                }
                if report.percentage.is_some() {
                    operation.percentage = report.percentage;
                }
                ProgressChange::Reported(operation.title.clone())
            }
            WorkDoneProgress::End(_) => match self.operations.remove(&key) {
                Some(operation) => ProgressChange::Ended(operation.title),
                None => ProgressChange::Unknown,
            },
        }
    }

    /// The least advanced running operation, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&WorkProgress> {
        self.operations
            .values()
            .min_by_key(|p| p.percentage.unwrap_or(0))
    }

    /// Whether any operation is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.operations.is_empty()
    }

    /// Forgets every operation; used when the backend restarts.
    pub fn clear(&mut self) {
        self.operations.clear();
    }
}

/// Snapshot of a client for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Display name of the client.
    pub name: String,
    /// Current lifecycle state.
    pub state: ClientState,
    /// Requests waiting for an answer.
    pub pending_requests: usize,
    /// Restarts still allowed.
    pub restarts_left: u32,
    /// Title of the primary progress operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_title: Option<String>,
    /// Percentage of the primary progress operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use lsp_types::{WorkDoneProgressBegin, WorkDoneProgressEnd, WorkDoneProgressReport};

    fn params(token: NumberOrString, progress: WorkDoneProgress) -> ProgressParams {
        ProgressParams {
            token,
            value: ProgressParamsValue::WorkDone(progress),
        }
    }

    fn begin(title: &str, percentage: u32) -> WorkDoneProgress {
        WorkDoneProgress::Begin(WorkDoneProgressBegin {
            title: title.to_string(),
            cancellable: None,
            message: None,
            percentage: Some(percentage),
        })
    }

    #[test]
    fn test_forward_transitions_only() {
        use ClientState::{
            Error, InitializeRequested, Initialized, Shutdown, ShutdownRequested, Uninitialized,
        };

        assert!(Uninitialized.can_advance_to(InitializeRequested));
        assert!(InitializeRequested.can_advance_to(Initialized));
        assert!(Initialized.can_advance_to(ShutdownRequested));
        assert!(ShutdownRequested.can_advance_to(Shutdown));
        assert!(Initialized.can_advance_to(Error));

        assert!(!Uninitialized.can_advance_to(Initialized));
        assert!(!Initialized.can_advance_to(InitializeRequested));
        assert!(!Shutdown.can_advance_to(Uninitialized));
        assert!(!Error.can_advance_to(Uninitialized));
        assert!(!Error.can_advance_to(Error));
    }

    #[test]
    fn test_only_initialized_is_reachable() {
        for state in [
            ClientState::Uninitialized,
            ClientState::InitializeRequested,
            ClientState::ShutdownRequested,
            ClientState::Shutdown,
            ClientState::Error,
        ] {
            assert!(!state.is_reachable(), "{state} must not be reachable");
        }
        assert!(ClientState::Initialized.is_reachable());
    }

    #[test]
    fn test_progress_lifecycle_with_numeric_token() -> Result<()> {
        let mut tracker = ProgressTracker::default();
        let token = NumberOrString::Number(4);

        assert_eq!(
            tracker.apply(&params(token.clone(), begin("Indexing", 0))),
            ProgressChange::Began("Indexing".to_string())
        );
        tracker.apply(&params(
            token.clone(),
            WorkDoneProgress::Report(WorkDoneProgressReport {
                cancellable: None,
                message: Some("crate 3/9".to_string()),
                percentage: Some(33),
            }),
        ));

        let primary = tracker.primary().context("expected progress")?;
        assert_eq!(primary.percentage, Some(33));
        assert_eq!(primary.message.as_deref(), Some("crate 3/9"));

        assert_eq!(
            tracker.apply(&params(
                token,
                WorkDoneProgress::End(WorkDoneProgressEnd { message: None })
            )),
            ProgressChange::Ended("Indexing".to_string())
        );
        assert!(!tracker.is_busy());
        Ok(())
    }

    #[test]
    fn test_primary_is_least_advanced() -> Result<()> {
        let mut tracker = ProgressTracker::default();
        tracker.apply(&params(NumberOrString::String("a".into()), begin("Loading", 80)));
        tracker.apply(&params(NumberOrString::String("b".into()), begin("Checking", 5)));

        assert_eq!(tracker.primary().context("progress")?.title, "Checking");
        Ok(())
    }

    #[test]
    fn test_end_for_unknown_token() {
        let mut tracker = ProgressTracker::default();
        let change = tracker.apply(&params(
            NumberOrString::String("ghost".into()),
            WorkDoneProgress::End(WorkDoneProgressEnd { message: None }),
        ));
        assert_eq!(change, ProgressChange::Unknown);
    }
}
