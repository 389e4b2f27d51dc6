//! Burst collection: wait for a run of inbound messages to settle before
//! answering it as one batch.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::conversation::filter::FilterSet;
use crate::conversation::model::{Message, Sender, Transcript};
use crate::error::SurfaceError;
use crate::surface::MessageSurface;

/// Polling parameters for one collection.
#[derive(Debug, Clone, Copy)]
pub struct BurstSettings {
    pub poll_interval: Duration,
    /// Quiet polls in a row that mark the burst as settled.
    pub settle_polls: u32,
    pub max_polls: u32,
}

impl From<&EngineConfig> for BurstSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.burst_poll_interval,
            settle_polls: config.burst_settle_polls,
            max_polls: config.burst_max_polls,
        }
    }
}

/// A settled batch of inbound messages.
#[derive(Debug, Clone)]
pub struct Burst {
    /// Latest transcript that contains every message of the batch.
    pub transcript: Transcript,
    /// Inbound messages of the batch, oldest first.
    pub messages: Vec<Message>,
    pub polls: u32,
    /// `false` when the poll cap was hit before the burst went quiet.
    pub settled: bool,
}

impl Burst {
    pub fn texts(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.text.clone()).collect()
    }
}

/// Polls one contact's transcript until new inbound stops arriving.
pub struct BurstCollector<'a> {
    surface: &'a dyn MessageSurface,
    filters: &'a FilterSet,
    settings: BurstSettings,
}

impl<'a> BurstCollector<'a> {
    pub fn new(surface: &'a dyn MessageSurface, filters: &'a FilterSet, settings: BurstSettings) -> Self {
        Self {
            surface,
            filters,
            settings,
        }
    }

    /// Collect the burst that started with `initial` / `trigger`.
    ///
    /// Inbound text is deduplicated across polls by exact text. A poll that
    /// fails or comes back empty counts as quiet; only session errors abort.
    pub async fn collect(
        &self,
        contact: &str,
        initial: Transcript,
        trigger: Vec<Message>,
    ) -> Result<Burst, SurfaceError> {
        let mut seen: HashSet<String> = initial.inbound().map(|m| m.text.clone()).collect();
        let mut latest = initial;
        let mut messages = trigger;
        let mut stable = 0u32;
        let mut polls = 0u32;

        while stable < self.settings.settle_polls && polls < self.settings.max_polls {
            tokio::time::sleep(self.settings.poll_interval).await;
            polls += 1;

            let raw = match self.surface.read_transcript(contact).await {
                Ok(raw) => raw,
                Err(e) if e.is_session() => return Err(e),
                Err(e) => {
                    warn!(contact, error = %e, "Burst poll failed");
                    stable += 1;
                    continue;
                }
            };
            if raw.is_empty() {
                stable += 1;
                continue;
            }

            let transcript = Transcript::from_raw(raw, self.filters);
            let fresh: Vec<Message> = transcript
                .messages
                .iter()
                .filter(|m| m.sender == Sender::Theirs && !seen.contains(&m.text))
                .cloned()
                .collect();

            if fresh.is_empty() {
                // A repeat of earlier text still belongs in the transcript
                // the decision is made for.
                if transcript.inbound_count() > latest.inbound_count() {
                    latest = transcript;
                }
                stable += 1;
                continue;
            }

            debug!(contact, new = fresh.len(), poll = polls, "Burst grew");
            for m in &fresh {
                seen.insert(m.text.clone());
            }
            messages.extend(fresh);
            latest = transcript;
            stable = 0;
        }

        let settled = stable >= self.settings.settle_polls;
        debug!(contact, polls, settled, batch = messages.len(), "Burst collected");
        Ok(Burst {
            transcript: latest,
            messages,
            polls,
            settled,
        })
    }
}
