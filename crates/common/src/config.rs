//! Engine configuration
//!
//! Selected once at process startup; the lock policy and version GC knobs
//! must not change after the first table is created.

use serde::{Deserialize, Serialize};

/// Concurrency-control protocol the process runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Dependency-graph deferred commit.
    Rcc,
    /// Read-only fast path over multi-versioned rows.
    Rot,
    /// Strict two-phase locking.
    TwoPl,
    /// Optimistic concurrency control over versioned rows.
    Occ,
}

/// Scheduling policy for per-column adaptive locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockPolicy {
    WaitDie,
    WoundDie,
    Timeout,
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency-control protocol.
    pub mode: RunMode,
    /// Adaptive lock scheduling policy for 2PL.
    pub lock_policy: LockPolicy,
    /// Version history GC runs every this many retained versions per column.
    pub gc_threshold: usize,
    /// Versions older than this are eligible for GC.
    pub version_safe_time_ms: u64,
    /// Deadline for pending lock requests under the timeout policy.
    pub lock_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Rcc,
            lock_policy: LockPolicy::WaitDie,
            gc_threshold: 100,
            version_safe_time_ms: 5000,
            lock_timeout_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Create a config for the given protocol with default knobs.
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set the lock scheduling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Set the GC threshold (versions per column between GC passes).
    pub fn with_gc_threshold(mut self, threshold: usize) -> Self {
        self.gc_threshold = threshold;
        self
    }

    /// Set the version safe time in milliseconds.
    pub fn with_version_safe_time_ms(mut self, ms: u64) -> Self {
        self.version_safe_time_ms = ms;
        self
    }

    /// Set the pending-lock deadline in milliseconds.
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }
}
