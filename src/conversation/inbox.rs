//! Inbox scanner: second entry path that discovers contacts from the
//! unread list instead of the active set.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SurfaceError;
use crate::surface::MessageSurface;

pub struct InboxScanner {
    surface: Arc<dyn MessageSurface>,
}

impl InboxScanner {
    pub fn new(surface: Arc<dyn MessageSurface>) -> Self {
        Self { surface }
    }

    /// Unread contacts worth a pass this cycle, in inbox order.
    ///
    /// Skips contacts already handled this cycle and rows whose preview is
    /// our own message. A failed listing yields nothing; only session errors
    /// are returned.
    pub async fn scan(&self, handled: &HashSet<String>) -> Result<Vec<String>, SurfaceError> {
        let previews = match self.surface.list_unread().await {
            Ok(p) => p,
            Err(e) if e.is_session() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Inbox listing failed");
                return Ok(Vec::new());
            }
        };

        let mut picked = Vec::new();
        let mut seen = HashSet::new();
        for preview in previews {
            if preview.preview_is_ours {
                debug!(contact = %preview.name, "Unread row shows our message, skipping");
                continue;
            }
            if handled.contains(&preview.name) || !seen.insert(preview.name.clone()) {
                continue;
            }
            picked.push(preview.name);
        }
        if !picked.is_empty() {
            debug!(count = picked.len(), "Inbox scan found contacts");
        }
        Ok(picked)
    }
}
