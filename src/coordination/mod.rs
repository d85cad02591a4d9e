//! Transfer coordination
//!
//! The coordination layer:
//! 1. Writes a pending status row for every initiated transfer
//! 2. Parks the caller on a per-block rendezvous
//! 3. Routes block callbacks to the waiting caller, or straight to the store
//! 4. Evicts rendezvous entries whose callback never arrives

pub mod coordinator;
pub mod reaper;
pub mod registry;
pub mod service;

pub use coordinator::TransferCoordinator;
pub use reaper::StaleReaper;
pub use registry::{CallbackResult, PendingRegistry};
pub use service::{TransferRequest, TransferService};
