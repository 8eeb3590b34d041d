//! GPU Memory Accounting
//!
//! Budgets and statistics for GPU memory owned by engine subsystems:
//! - Byte budgets with a warning threshold
//! - Lock-free allocation statistics readable from any thread
//!
//! Budgets are advisory. Subsystems that must not fail an allocation (tile
//! heaps, for example) report their usage against a budget and log when it is
//! crossed, but never refuse to grow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Memory budget configuration for a subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudget {
    /// Maximum bytes for this subsystem
    pub max_bytes: u64,
    /// Warning threshold (fraction of max)
    pub warning_threshold: f32,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512 MB default
            warning_threshold: 0.8,
        }
    }
}

/// Where a usage figure sits relative to a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Below the warning threshold
    Nominal,
    /// At or above the warning threshold but within the budget
    Warning,
    /// Above the budget
    Exceeded,
}

impl MemoryBudget {
    /// Create a budget with the default warning threshold
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Default::default()
        }
    }

    /// Byte count at which the warning threshold is reached
    pub fn warning_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.warning_threshold.clamp(0.0, 1.0) as f64) as u64
    }

    /// Classify a usage figure against this budget
    pub fn status(&self, used_bytes: u64) -> BudgetStatus {
        if used_bytes > self.max_bytes {
            BudgetStatus::Exceeded
        } else if used_bytes >= self.warning_bytes() {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Nominal
        }
    }
}

/// Memory tracking statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Total bytes allocated
    allocated: AtomicU64,
    /// Peak bytes allocated
    peak: AtomicU64,
    /// Number of allocations
    allocation_count: AtomicU64,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation and return the new total
    pub fn record_alloc(&self, size: u64) -> u64 {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(new_size, Ordering::Relaxed);
        new_size
    }

    /// Record a deallocation
    pub fn record_dealloc(&self, size: u64) {
        let previous = self.allocated.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(previous >= size, "deallocated more bytes than were allocated");
    }

    /// Get current allocated bytes
    pub fn current(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
    }
}
