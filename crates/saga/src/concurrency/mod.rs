//! Concurrency control for saga writes and stock reservation.

pub mod coordinator;
pub mod lock_table;

pub use coordinator::{ConcurrencyCoordinator, ConcurrencyReport, ConcurrencyStats};
pub use lock_table::{Lease, LockTable};
