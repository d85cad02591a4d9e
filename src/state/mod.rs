//! Transfer status persistence
//!
//! Handles:
//! - One durable row per transfer, keyed by request id
//! - Lookup by block id for callbacks without a waiter
//! - Terminal-state guarding on updates
//! - Restart recovery of rows left pending

mod store;

pub use store::{StatusStore, StatusUpdate, TransferState, TransferStats, TransferStatus, UpdateOutcome};

#[cfg(test)]
pub(crate) use store::testing;
