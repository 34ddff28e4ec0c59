// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Delivery counters for one coordinator.
#[derive(Debug, Default)]
pub struct Stats {
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    entries_cached: AtomicU64,
    entries_requeued: AtomicU64,
    entries_confirmed: AtomicU64,
    entries_dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl Stats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            entries_cached: AtomicU64::new(0),
            entries_requeued: AtomicU64::new(0),
            entries_confirmed: AtomicU64::new(0),
            entries_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// An entry fully written to a connection.
    #[inline]
    pub fn record_written(&self, bytes: usize) {
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cached(&self) {
        self.entries_cached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_requeued(&self, count: usize) {
        self.entries_requeued
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_confirmed(&self) {
        self.entries_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries removed by a processor before delivery.
    #[inline]
    pub fn record_dropped(&self, count: usize) {
        self.entries_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            entries_cached: self.entries_cached.load(Ordering::Relaxed),
            entries_requeued: self.entries_requeued.load(Ordering::Relaxed),
            entries_confirmed: self.entries_confirmed.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub entries_cached: u64,
    pub entries_requeued: u64,
    pub entries_confirmed: u64,
    pub entries_dropped: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let stats = Stats::new();
        stats.record_written(10);
        stats.record_written(5);
        stats.record_cached();
        stats.record_requeued(3);
        stats.record_confirmed();
        stats.record_dropped(2);
        stats.record_reconnect();

        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot,
            StatsSnapshot {
                entries_written: 2,
                bytes_written: 15,
                entries_cached: 1,
                entries_requeued: 3,
                entries_confirmed: 1,
                entries_dropped: 2,
                reconnects: 1,
            }
        );
        let json = serde_json::to_value(snapshot).expect("serialize");
        assert_eq!(json["bytes_written"], 15);
    }
}
