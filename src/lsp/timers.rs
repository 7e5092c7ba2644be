// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! One-shot timers for the manager's event loop.

use std::collections::BTreeMap;
use tokio::time::Instant;

use super::transport::ClientId;

/// Work scheduled for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Start the client again after an unexpected finish.
    Restart(ClientId),
    /// Retire every client that is still alive.
    ShutdownDeadline,
}

/// Pending timers ordered by deadline, then by scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Timer>,
    sequence: u64,
}

impl TimerQueue {
    /// Schedules `timer` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, timer: Timer) {
        self.sequence += 1;
        self.entries.insert((deadline, self.sequence), timer);
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        let entry = self.entries.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        Some(entry.remove())
    }

    /// Drops every pending timer equal to `timer`.
    pub fn cancel(&mut self, timer: Timer) {
        self.entries.retain(|_, pending| *pending != timer);
    }

    /// Whether `timer` is pending.
    #[must_use]
    pub fn contains(&self, timer: Timer) -> bool {
        self.entries.values().any(|pending| *pending == timer)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let base = Instant::now();
        let mut queue = TimerQueue::default();
        queue.schedule(base + Duration::from_secs(5), Timer::Restart(ClientId(1)));
        queue.schedule(base + Duration::from_secs(3), Timer::ShutdownDeadline);

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(3)));
        assert_eq!(queue.pop_due(base + Duration::from_secs(2)), None);
        assert_eq!(
            queue.pop_due(base + Duration::from_secs(10)),
            Some(Timer::ShutdownDeadline)
        );
        assert_eq!(
            queue.pop_due(base + Duration::from_secs(10)),
            Some(Timer::Restart(ClientId(1)))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_deadline_keeps_insertion_order() {
        let at = Instant::now();
        let mut queue = TimerQueue::default();
        queue.schedule(at, Timer::Restart(ClientId(2)));
        queue.schedule(at, Timer::Restart(ClientId(1)));

        assert_eq!(queue.pop_due(at), Some(Timer::Restart(ClientId(2))));
        assert_eq!(queue.pop_due(at), Some(Timer::Restart(ClientId(1))));
    }

    #[test]
    fn test_cancel() {
        let at = Instant::now();
        let mut queue = TimerQueue::default();
        queue.schedule(at, Timer::Restart(ClientId(7)));
        queue.schedule(at, Timer::ShutdownDeadline);

        queue.cancel(Timer::Restart(ClientId(7)));
        assert!(!queue.contains(Timer::Restart(ClientId(7))));
        assert_eq!(queue.len(), 1);
    }
}
