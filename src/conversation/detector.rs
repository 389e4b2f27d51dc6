//! Change detection against the last acknowledged fingerprint.
//!
//! Two signals are combined:
//! - inbound count went up: cheap and immune to render noise
//! - hash differs while the last message is theirs: catches edits and the
//!   first read after a restart, where counts can line up by accident
//!
//! Detection is a pure function of its inputs. It never touches the store.

use serde::{Deserialize, Serialize};

use crate::conversation::fingerprint::Fingerprint;
use crate::conversation::model::{Message, Sender, Transcript};

/// Outcome of comparing a fresh read with the stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Nothing to do.
    Unchanged,
    /// They wrote something we have not handled.
    NewInbound,
    /// The thread moved but the last word is ours; only the stored
    /// fingerprint needs refreshing.
    OwnMessageConfirmed,
}

impl ChangeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::NewInbound => "new_inbound",
            Self::OwnMessageConfirmed => "own_message_confirmed",
        }
    }
}

/// Result of one detection.
#[derive(Debug, Clone)]
pub struct Detection {
    pub status: ChangeStatus,
    /// Fingerprint of the transcript that was classified.
    pub current: Fingerprint,
    /// Inbound messages considered new. Empty unless `NewInbound`.
    pub new_inbound: Vec<Message>,
}

/// Classify `transcript` against the previously acknowledged fingerprint.
pub fn detect(previous: Option<&Fingerprint>, transcript: &Transcript) -> Detection {
    let current = transcript.fingerprint();
    let last = transcript.last_sender();

    let status = match (previous, last) {
        (_, None) => ChangeStatus::Unchanged,
        (None, Some(Sender::Theirs)) => ChangeStatus::NewInbound,
        (None, Some(Sender::Ours)) => ChangeStatus::OwnMessageConfirmed,
        (Some(prev), Some(last)) => {
            let hash_changed = prev.hash != current.hash;
            if current.inbound > prev.inbound || (hash_changed && last == Sender::Theirs) {
                ChangeStatus::NewInbound
            } else if hash_changed && last == Sender::Ours {
                ChangeStatus::OwnMessageConfirmed
            } else {
                ChangeStatus::Unchanged
            }
        }
    };

    let new_inbound = if status == ChangeStatus::NewInbound {
        new_inbound_messages(previous, transcript, &current)
    } else {
        Vec::new()
    };

    Detection {
        status,
        current,
        new_inbound,
    }
}

/// Pick the inbound messages a `NewInbound` detection refers to.
///
/// Normally the unanswered tail. If our message is already last (someone
/// replied by hand), fall back to the count delta.
fn new_inbound_messages(
    previous: Option<&Fingerprint>,
    transcript: &Transcript,
    current: &Fingerprint,
) -> Vec<Message> {
    let tail = transcript.unanswered_tail();
    if !tail.is_empty() {
        return tail;
    }
    let delta = previous
        .map(|p| current.inbound.saturating_sub(p.inbound))
        .unwrap_or(current.inbound);
    transcript.last_inbound(delta.max(1))
}
