//! Message surface: the DM inbox the engine reads and writes through.
//!
//! The surface is a live UI driven by a scraper. It can lag, render the same
//! thread twice, or come back empty, and it offers no push events. Every
//! call may suspend for as long as the page takes to respond.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::model::RawMessage;
use crate::error::SurfaceError;

pub use http::HttpSurface;
pub use memory::MemorySurface;

/// One row of the inbox list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadPreview {
    pub name: String,
    pub preview_text: String,
    /// The preview line is our own message ("You: ...").
    pub preview_is_ours: bool,
}

/// Trait for message surfaces: pure I/O, no business logic.
///
/// `send_message` writes into whichever conversation was opened last.
#[async_trait]
pub trait MessageSurface: Send + Sync {
    /// Surface name for logging.
    fn name(&self) -> &str;

    /// Confirm the account session is alive.
    ///
    /// Returns `SurfaceError::Session` when logged out, banned or unreachable.
    async fn check_session(&self) -> Result<(), SurfaceError>;

    /// Contacts with unread messages, as shown in the inbox list.
    async fn list_unread(&self) -> Result<Vec<UnreadPreview>, SurfaceError>;

    /// Open a conversation. `Ok(false)` when the contact could not be found.
    async fn open_contact(&self, name: &str) -> Result<bool, SurfaceError>;

    /// Current ordered transcript for a contact, oldest first.
    async fn read_transcript(&self, name: &str) -> Result<Vec<RawMessage>, SurfaceError>;

    /// Send into the open conversation. `Ok(false)` when not confirmed.
    async fn send_message(&self, text: &str) -> Result<bool, SurfaceError>;
}
