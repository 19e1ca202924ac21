//! Server-wide counters shared by every reactor.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters, updated by the reactors with relaxed atomics.
#[derive(Debug, Default)]
pub struct Stats {
    active: AtomicUsize,
    accepted: AtomicU64,
    closed: AtomicU64,
    rejected: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Connections currently in a connection table.
    pub active_connections: usize,
    pub accepted: u64,
    pub closed: u64,
    /// Connections dropped because a table was full.
    pub rejected: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Number of connections currently open across all reactors.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.received(10);
        stats.sent(4);
        stats.sent(6);
        stats.connection_closed();
        stats.connection_rejected();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                active_connections: 1,
                accepted: 2,
                closed: 1,
                rejected: 1,
                bytes_received: 10,
                bytes_sent: 10,
            }
        );
        assert_eq!(stats.active_connections(), 1);
    }
}
