//! Blockchain node access
//!
//! The coordinator only needs two calls from a node: submit a contract
//! execution and read the latest block of a contract's token chain.

mod client;

pub use client::{HttpNodeClient, NodeClient};

#[cfg(test)]
pub use client::MockNodeClient;
