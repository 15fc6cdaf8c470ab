//! Time-windowed duplicate suppression for inbound platform events.
//!
//! Platforms deliver updates at least once, so the same message can arrive
//! twice (webhook retries, poll loop overlap across a restart).  The cache
//! remembers a digest of `(sender, message id, text)` with the time it was
//! last seen.  Memory is bounded by a periodic [`DedupCache::sweep`].

use std::collections::HashMap;
use std::time::Duration;

use ring::digest;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupConfig;

type Key = [u8; 32];

/// Outcome of one [`DedupCache::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub trimmed: usize,
    pub remaining: usize,
}

pub struct DedupCache {
    entries: HashMap<Key, Instant>,
    suppression: Duration,
    retention: Duration,
    max_entries: usize,
    keep_entries: usize,
}

impl DedupCache {
    pub fn new(cfg: &DedupConfig) -> Self {
        Self {
            entries: HashMap::new(),
            suppression: Duration::from_secs(cfg.suppression_secs),
            retention: Duration::from_secs(cfg.retention_secs),
            max_entries: cfg.max_entries,
            keep_entries: cfg.keep_entries.min(cfg.max_entries),
        }
    }

    /// Record a sighting and report whether it repeats one seen within the
    /// suppression window.
    pub fn is_duplicate(&mut self, sender_id: &str, message_id: &str, text: &str) -> bool {
        self.check_at(sender_id, message_id, text, Instant::now())
    }

    pub(crate) fn check_at(
        &mut self,
        sender_id: &str,
        message_id: &str,
        text: &str,
        now: Instant,
    ) -> bool {
        let key = composite_key(sender_id, message_id, text);
        match self.entries.insert(key, now) {
            Some(last_seen) => now.saturating_duration_since(last_seen) < self.suppression,
            None => false,
        }
    }

    /// Drop expired entries, then trim to the most recent `keep_entries`
    /// when the hard cap is exceeded.
    pub fn sweep(&mut self) -> SweepStats {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&mut self, now: Instant) -> SweepStats {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) <= retention);
        let expired = before - self.entries.len();

        let mut trimmed = 0;
        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<(Key, Instant)> =
                self.entries.iter().map(|(k, v)| (*k, *v)).collect();
            // Newest first; everything past `keep_entries` goes.
            by_age.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in by_age.into_iter().skip(self.keep_entries) {
                self.entries.remove(&key);
                trimmed += 1;
            }
        }

        let stats = SweepStats {
            expired,
            trimmed,
            remaining: self.entries.len(),
        };
        if expired > 0 || trimmed > 0 {
            debug!(
                expired = stats.expired,
                trimmed = stats.trimmed,
                remaining = stats.remaining,
                "dedup sweep"
            );
        }
        stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
fn composite_key(sender_id: &str, message_id: &str, text: &str) -> Key {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in [sender_id, message_id, text] {
        ctx.update(&(part.len() as u64).to_le_bytes());
        ctx.update(part.as_bytes());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(ctx.finish().as_ref());
    key
}
