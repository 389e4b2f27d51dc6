//! Conversation engine: model, change detection, burst collection, the
//! per-contact state machine and the polling loop around it.

pub mod burst;
pub mod controller;
pub mod detector;
pub mod filter;
pub mod fingerprint;
pub mod inbox;
pub mod model;
pub mod orchestrator;

pub use controller::{Engine, RunReport, StopReason};
pub use detector::{ChangeStatus, Detection, detect};
pub use filter::{FilterSet, MessageFilter};
pub use fingerprint::Fingerprint;
pub use orchestrator::{Handled, Outcome, ReplyOrchestrator};
