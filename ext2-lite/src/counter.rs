//! Sharded approximate counters.
//!
//! Free-block, free-inode and directory counts are kept as sums over a
//! small array of shards so concurrent updates do not contend on a single
//! cache line. Reads fold all shards and are hints only; the authoritative
//! counts live in the on-disk group descriptors.

use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

const SHARDS: usize = 8;

/// An eventually-consistent counter. May transiently over-report, never
/// reads below zero.
pub struct ApproxCounter {
    shards: [AtomicI64; SHARDS],
    cursor: AtomicUsize,
}

impl ApproxCounter {
    pub fn new(initial: u64) -> Self {
        let shards = [const { AtomicI64::new(0) }; SHARDS];
        shards[0].store(initial as i64, Ordering::Relaxed);
        Self {
            shards,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Apply a signed delta to one shard.
    pub fn add(&self, delta: i64) {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % SHARDS;
        self.shards[i].fetch_add(delta, Ordering::Relaxed);
    }

    /// Fold all shards. The result is approximate under concurrent
    /// updates and is clamped at zero.
    pub fn read(&self) -> u64 {
        let sum: i64 = self
            .shards
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .sum();
        sum.max(0) as u64
    }

    /// Reset to an authoritative value.
    pub fn set(&self, value: u64) {
        for s in &self.shards[1..] {
            s.store(0, Ordering::Relaxed);
        }
        self.shards[0].store(value as i64, Ordering::Relaxed);
    }
}
