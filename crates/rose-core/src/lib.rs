//! # Rose Core
//!
//! Foundation types shared by the Rose renderer crates:
//! - **Handles**: Generational identifiers that stay unambiguous after their object is destroyed
//! - **Memory**: GPU memory budgets and allocation statistics

pub mod handle;
pub mod memory;

pub use handle::{Handle, HandleAllocator};
pub use memory::{BudgetStatus, MemoryBudget, MemoryStats};

/// Bytes in one kibibyte
pub const KIB: u64 = 1024;

/// Bytes in one mebibyte
pub const MIB: u64 = 1024 * KIB;
