//! Shared state for the collector.
//!
//! This module tracks:
//! - The service lifecycle (Starting → Running → ShuttingDown → Stopped)
//! - Message counters, for the shutdown summary

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Service lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        matches!(
            (self, next),
            (Lifecycle::Starting, Lifecycle::Running)
                | (Lifecycle::Starting, Lifecycle::Stopped)
                | (Lifecycle::Running, Lifecycle::ShuttingDown)
                | (Lifecycle::ShuttingDown, Lifecycle::Stopped)
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::ShuttingDown => "shutting-down",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub truncated: u64,
    pub write_failures: u64,
    pub receive_errors: u64,
}

/// Shared service state
pub struct ServiceState {
    lifecycle: RwLock<Lifecycle>,
    received: AtomicU64,
    persisted: AtomicU64,
    truncated: AtomicU64,
    write_failures: AtomicU64,
    receive_errors: AtomicU64,
    started_at: Instant,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            lifecycle: RwLock::new(Lifecycle::Starting),
            received: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Move to `next`; returns false and leaves the state alone if the
    /// transition is not allowed
    pub fn transition(&self, next: Lifecycle) -> bool {
        let mut current = self.lifecycle.write();
        let from = *current;
        if !from.can_transition_to(next) {
            tracing::warn!(from = %from, to = %next, "Rejected lifecycle transition");
            return false;
        }
        tracing::debug!(from = %from, to = %next, "Lifecycle transition");
        *current = next;
        true
    }

    pub fn record_received(&self, truncated: bool) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if truncated {
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = ServiceState::new();
        assert_eq!(state.lifecycle(), Lifecycle::Starting);
        assert_eq!(state.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_full_lifecycle() {
        let state = ServiceState::new();
        assert!(state.transition(Lifecycle::Running));
        assert!(state.transition(Lifecycle::ShuttingDown));
        assert!(state.transition(Lifecycle::Stopped));
        assert_eq!(state.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn test_failed_start_goes_straight_to_stopped() {
        let state = ServiceState::new();
        assert!(state.transition(Lifecycle::Stopped));
        assert!(!state.transition(Lifecycle::Running));
        assert_eq!(state.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn test_rejected_transitions() {
        let state = ServiceState::new();
        assert!(!state.transition(Lifecycle::ShuttingDown));
        assert!(state.transition(Lifecycle::Running));
        assert!(!state.transition(Lifecycle::Starting));
        assert!(!state.transition(Lifecycle::Running));
        assert_eq!(state.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn test_counters() {
        let state = ServiceState::new();
        state.record_received(false);
        state.record_received(true);
        state.record_persisted();
        state.record_write_failure();
        state.record_receive_error();

        assert_eq!(
            state.stats(),
            StatsSnapshot {
                received: 2,
                persisted: 1,
                truncated: 1,
                write_failures: 1,
                receive_errors: 1,
            }
        );
    }
}
