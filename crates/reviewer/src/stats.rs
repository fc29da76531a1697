use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide reviewer counters. `Reviewer` is typically held behind an
/// `Arc` and shared across every experiment worker, so these are atomics
/// rather than a `Mutex`-guarded struct — the "must be updated atomically"
/// requirement from the concurrency model, not just a stylistic choice.
#[derive(Debug, Default)]
pub struct ReviewerStats {
    total_reviews: AtomicU64,
    blocked: AtomicU64,
    warned: AtomicU64,
    rewritten: AtomicU64,
    escalated: AtomicU64,
    accepted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct DefenseStatistics {
    pub total_reviews: u64,
    pub blocked: u64,
    pub warned: u64,
    pub rewritten: u64,
    pub escalated: u64,
    pub accepted: u64,
    pub block_rate: f64,
    pub warn_rate: f64,
    pub rewrite_rate: f64,
}

impl ReviewerStats {
    pub fn record_block(&self) {
        self.total_reviews.fetch_add(1, Ordering::Relaxed);
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_warn(&self) {
        self.total_reviews.fetch_add(1, Ordering::Relaxed);
        self.warned.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_rewrite(&self) {
        self.total_reviews.fetch_add(1, Ordering::Relaxed);
        self.rewritten.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_escalate(&self) {
        self.total_reviews.fetch_add(1, Ordering::Relaxed);
        self.escalated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_accept(&self) {
        self.total_reviews.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DefenseStatistics {
        let total = self.total_reviews.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let warned = self.warned.load(Ordering::Relaxed);
        let rewritten = self.rewritten.load(Ordering::Relaxed);
        let escalated = self.escalated.load(Ordering::Relaxed);
        let accepted = self.accepted.load(Ordering::Relaxed);
        let denom = total.max(1) as f64;
        DefenseStatistics {
            total_reviews: total,
            blocked,
            warned,
            rewritten,
            escalated,
            accepted,
            block_rate: blocked as f64 / denom,
            warn_rate: warned as f64 / denom,
            rewrite_rate: rewritten as f64 / denom,
        }
    }

    pub fn reset(&self) {
        self.total_reviews.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.warned.store(0, Ordering::Relaxed);
        self.rewritten.store(0, Ordering::Relaxed);
        self.escalated.store(0, Ordering::Relaxed);
        self.accepted.store(0, Ordering::Relaxed);
    }
}
