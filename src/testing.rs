//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::conversation::model::Transcript;
use crate::error::{NotifyError, PolicyError, SessionProblem};
use crate::notify::SessionNotifier;
use crate::policy::{PolicyContext, PolicyDecision, PolicyInvoker};

/// Policy that answers from a script, in order. Runs dry with
/// `PolicyError::Unavailable`.
pub struct ScriptedPolicy {
    script: Mutex<VecDeque<Result<PolicyDecision, PolicyError>>>,
    contexts: Mutex<Vec<PolicyContext>>,
}

impl ScriptedPolicy {
    pub fn new(script: Vec<Result<PolicyDecision, PolicyError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<PolicyContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyInvoker for ScriptedPolicy {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        _transcript: &Transcript,
        context: &PolicyContext,
    ) -> Result<PolicyDecision, PolicyError> {
        self.contexts.lock().unwrap().push(context.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PolicyError::Unavailable("script exhausted".into())))
    }
}

/// Notifier that remembers what it was told.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, SessionProblem, String)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, SessionProblem, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionNotifier for RecordingNotifier {
    async fn notify_session_problem(
        &self,
        account_id: &str,
        kind: SessionProblem,
        message: &str,
    ) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap()
            .push((account_id.to_string(), kind, message.to_string()));
        Ok(())
    }
}
