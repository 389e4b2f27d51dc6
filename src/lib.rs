//! DM autopilot: keeps direct-message conversations answered.
//!
//! A single polling loop reads transcripts from a message surface, detects
//! new inbound messages by fingerprint, batches bursts, asks a reply policy
//! what to say, and records the outcome so restarts pick up where the last
//! run stopped.

pub mod config;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod policy;
pub mod store;
pub mod surface;

#[cfg(test)]
pub(crate) mod testing;
