//! Background analytics collection.
//!
//! A [`CollectionManager`] wakes once a day to collect every connected
//! owner in fixed-size batches, and accepts on-demand submissions through
//! a bounded queue. Each attempt is recorded in the job ledger.

pub mod batch;
pub mod collector;
pub mod jitter;
pub mod manager;
pub mod schedule;

pub use batch::{run_batches, BatchSummary};
pub use collector::{Collector, SHUTDOWN_REASON};
pub use jitter::Jitter;
pub use manager::CollectionManager;
pub use schedule::DailySchedule;

#[cfg(test)]
mod tests_support;
