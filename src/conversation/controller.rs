//! Cycle controller: owns the polling loop.
//!
//! One loop, one contact at a time. Each cycle:
//! 1. stop if cancelled or idle for `idle_timeout`
//! 2. confirm the session (fatal on failure, escalated)
//! 3. process active contacts, then unread contacts from the inbox
//! 4. sleep a randomized pacing interval
//!
//! The idle timer resets on a newly detected inbound change or a sent
//! message, never on polling alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::conversation::filter::FilterSet;
use crate::conversation::inbox::InboxScanner;
use crate::conversation::model::{Contact, Lead};
use crate::conversation::orchestrator::{Handled, Outcome, ReplyOrchestrator};
use crate::error::{Error, SessionProblem, SurfaceError};
use crate::notify::SessionNotifier;
use crate::policy::PolicyInvoker;
use crate::store::ContactStore;
use crate::surface::MessageSurface;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    IdleTimeout,
    Cancelled,
    SessionLost {
        kind: SessionProblem,
        message: String,
    },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SessionLost { kind, message } => write!(f, "session lost ({kind}): {message}"),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stop: StopReason,
    pub cycles: u64,
    pub replies_sent: u64,
    pub policy_calls: u64,
    pub skipped: u64,
    pub archived: usize,
}

impl RunReport {
    fn new() -> Self {
        Self {
            stop: StopReason::Cancelled,
            cycles: 0,
            replies_sent: 0,
            policy_calls: 0,
            skipped: 0,
            archived: 0,
        }
    }

    fn record(&mut self, handled: &Handled) {
        if handled.outcome.sent() {
            self.replies_sent += 1;
        }
        if handled.policy_called {
            self.policy_calls += 1;
        }
        if handled.outcome == Outcome::Skipped {
            self.skipped += 1;
        }
    }
}

/// The engine: orchestrator, inbox scanner and loop lifetime.
pub struct Engine {
    config: EngineConfig,
    surface: Arc<dyn MessageSurface>,
    store: Arc<dyn ContactStore>,
    notifier: Arc<dyn SessionNotifier>,
    orchestrator: ReplyOrchestrator,
    inbox: InboxScanner,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        surface: Arc<dyn MessageSurface>,
        policy: Arc<dyn PolicyInvoker>,
        store: Arc<dyn ContactStore>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self::with_filters(
            config,
            surface,
            policy,
            store,
            notifier,
            FilterSet::default_filters(),
        )
    }

    pub fn with_filters(
        config: EngineConfig,
        surface: Arc<dyn MessageSurface>,
        policy: Arc<dyn PolicyInvoker>,
        store: Arc<dyn ContactStore>,
        notifier: Arc<dyn SessionNotifier>,
        filters: FilterSet,
    ) -> Self {
        let orchestrator = ReplyOrchestrator::new(
            config.clone(),
            Arc::clone(&surface),
            policy,
            Arc::clone(&store),
            filters,
        );
        let inbox = InboxScanner::new(Arc::clone(&surface));
        Self {
            config,
            surface,
            store,
            notifier,
            orchestrator,
            inbox,
        }
    }

    pub fn orchestrator(&self) -> &ReplyOrchestrator {
        &self.orchestrator
    }

    /// Track a contact we messaged first so it is polled from now on.
    pub async fn engage(&self, name: &str, lead: Option<&Lead>) -> Result<Contact, Error> {
        self.orchestrator.register_contact(name, lead).await
    }

    /// Archive WAITING/ENDED contacts idle longer than `archive_after`.
    pub async fn sweep(&self) -> Result<usize, Error> {
        let cutoff = before_now(self.config.archive_after);
        let archived = self
            .store
            .archive_inactive(&self.config.account_id, cutoff)
            .await?;
        if archived > 0 {
            info!(archived, "Archived inactive contacts");
        }
        Ok(archived)
    }

    /// Run until idle, cancelled or the session is lost.
    ///
    /// `cancel` is checked once per cycle; an in-flight send finishes first.
    pub async fn run(&self, cancel: Arc<AtomicBool>) -> Result<RunReport, Error> {
        let mut report = RunReport::new();
        info!(
            account = %self.config.account_id,
            surface = self.surface.name(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Engine started"
        );

        match self.sweep().await {
            Ok(n) => report.archived = n,
            Err(e) => warn!(error = %e, "Archive sweep failed"),
        }

        let mut last_activity = Instant::now();
        let mut seen_changes: HashMap<String, String> = HashMap::new();

        let stop = loop {
            if cancel.load(Ordering::Relaxed) {
                break StopReason::Cancelled;
            }
            if last_activity.elapsed() >= self.config.idle_timeout {
                break StopReason::IdleTimeout;
            }

            report.cycles += 1;
            match self.cycle(&mut report, &mut seen_changes).await {
                Ok(true) => last_activity = Instant::now(),
                Ok(false) => {}
                Err(Error::Surface(SurfaceError::Session { kind, message })) => {
                    error!(%kind, %message, "Session lost, stopping");
                    if let Err(e) = self
                        .notifier
                        .notify_session_problem(&self.config.account_id, kind, &message)
                        .await
                    {
                        error!(error = %e, "Failed to escalate session problem");
                    }
                    break StopReason::SessionLost { kind, message };
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(pacing_delay(self.config.pacing_min, self.config.pacing_max)).await;
        };

        report.stop = stop;
        info!(
            stop = %report.stop,
            cycles = report.cycles,
            replies = report.replies_sent,
            policy_calls = report.policy_calls,
            skipped = report.skipped,
            "Engine stopped"
        );
        Ok(report)
    }

    /// One pass over active and unread contacts. Returns whether anything
    /// counted as activity.
    async fn cycle(
        &self,
        report: &mut RunReport,
        seen_changes: &mut HashMap<String, String>,
    ) -> Result<bool, Error> {
        self.surface.check_session().await?;

        let since = before_now(self.config.active_window);
        let active = match self
            .store
            .list_active_contacts(&self.config.account_id, since)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to list active contacts");
                Vec::new()
            }
        };

        let mut handled_names: HashSet<String> = HashSet::new();
        let mut activity = false;

        for contact in active {
            activity |= self
                .handle(&contact.name, report, seen_changes)
                .await?;
            handled_names.insert(contact.name);
        }

        for name in self.inbox.scan(&handled_names).await? {
            activity |= self.handle(&name, report, seen_changes).await?;
            handled_names.insert(name);
        }

        debug!(contacts = handled_names.len(), activity, "Cycle done");
        Ok(activity)
    }

    /// Process one contact. Store failures are logged and count as a skip;
    /// session failures propagate.
    async fn handle(
        &self,
        name: &str,
        report: &mut RunReport,
        seen_changes: &mut HashMap<String, String>,
    ) -> Result<bool, Error> {
        let handled = match self.orchestrator.process_contact(name).await {
            Ok(h) => h,
            Err(Error::Surface(e)) if e.is_session() => return Err(Error::Surface(e)),
            Err(e) => {
                error!(contact = name, error = %e, "Contact processing failed");
                report.skipped += 1;
                return Ok(false);
            }
        };
        debug!(contact = name, outcome = handled.outcome.label(), "Contact handled");
        report.record(&handled);

        // The same unacknowledged change seen again (failed send, policy
        // outage) is not new activity.
        let fresh_change = handled.change.as_ref().is_some_and(|hash| {
            seen_changes.insert(name.to_string(), hash.clone()).as_ref() != Some(hash)
        });
        Ok(handled.outcome.sent() || fresh_change)
    }
}

fn before_now(window: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Random pause in `[min, max]`.
fn pacing_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}
