//! In-memory message surface for tests and dry runs.
//!
//! Threads live in a map. Arrivals can be scheduled to land after a given
//! number of transcript reads, which is how bursts and pre-send races are
//! reproduced without a browser.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::conversation::model::{RawMessage, Sender};
use crate::error::{SessionProblem, SurfaceError};
use crate::surface::{MessageSurface, UnreadPreview};

#[derive(Default)]
struct Thread {
    messages: Vec<RawMessage>,
    unread: bool,
    reads: usize,
    /// (read number at which it lands, text)
    scheduled: VecDeque<(usize, String)>,
    failing_reads: u32,
}

#[derive(Default)]
struct Inner {
    threads: HashMap<String, Thread>,
    open: Option<String>,
    sent: Vec<(String, String)>,
    failing_sends: u32,
    session: Option<(SessionProblem, String)>,
}

/// Scriptable in-process surface.
#[derive(Default)]
pub struct MemorySurface {
    inner: Mutex<Inner>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut inner)
    }

    /// Seed a thread without marking it unread.
    pub fn seed(&self, contact: &str, messages: Vec<RawMessage>) {
        self.with_inner(|inner| {
            inner.threads.entry(contact.to_string()).or_default().messages = messages;
        });
    }

    /// An inbound message arrives now and the thread shows as unread.
    pub fn deliver(&self, contact: &str, text: &str) {
        self.with_inner(|inner| {
            let thread = inner.threads.entry(contact.to_string()).or_default();
            thread.messages.push(RawMessage::theirs(text));
            thread.unread = true;
        });
    }

    /// An inbound message lands once the thread has been read `after_reads`
    /// more times.
    pub fn schedule_inbound(&self, contact: &str, after_reads: usize, text: &str) {
        self.with_inner(|inner| {
            let thread = inner.threads.entry(contact.to_string()).or_default();
            let at = thread.reads + after_reads;
            thread.scheduled.push_back((at, text.to_string()));
        });
    }

    /// The next `n` transcript reads for `contact` come back empty.
    pub fn fail_reads(&self, contact: &str, n: u32) {
        self.with_inner(|inner| {
            inner.threads.entry(contact.to_string()).or_default().failing_reads = n;
        });
    }

    /// The next `n` sends are not confirmed.
    pub fn fail_sends(&self, n: u32) {
        self.with_inner(|inner| inner.failing_sends = n);
    }

    /// Put the session into a failed state (or clear it with `None`).
    pub fn set_session_problem(&self, problem: Option<(SessionProblem, &str)>) {
        self.with_inner(|inner| {
            inner.session = problem.map(|(kind, msg)| (kind, msg.to_string()));
        });
    }

    /// Everything sent so far, as (contact, text).
    pub fn sent(&self) -> Vec<(String, String)> {
        self.with_inner(|inner| inner.sent.clone())
    }

    /// Number of transcript reads for a contact so far.
    pub fn reads(&self, contact: &str) -> usize {
        self.with_inner(|inner| inner.threads.get(contact).map(|t| t.reads).unwrap_or(0))
    }

    pub fn thread(&self, contact: &str) -> Vec<RawMessage> {
        self.with_inner(|inner| {
            inner
                .threads
                .get(contact)
                .map(|t| t.messages.clone())
                .unwrap_or_default()
        })
    }

    fn session_error(inner: &Inner) -> Option<SurfaceError> {
        inner.session.as_ref().map(|(kind, message)| SurfaceError::Session {
            kind: *kind,
            message: message.clone(),
        })
    }
}

#[async_trait]
impl MessageSurface for MemorySurface {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check_session(&self) -> Result<(), SurfaceError> {
        self.with_inner(|inner| match Self::session_error(inner) {
            Some(err) => Err(err),
            None => Ok(()),
        })
    }

    async fn list_unread(&self) -> Result<Vec<UnreadPreview>, SurfaceError> {
        self.with_inner(|inner| {
            if let Some(err) = Self::session_error(inner) {
                return Err(err);
            }
            let mut previews: Vec<UnreadPreview> = inner
                .threads
                .iter()
                .filter(|(_, t)| t.unread)
                .filter_map(|(name, t)| {
                    t.messages.last().map(|last| UnreadPreview {
                        name: name.clone(),
                        preview_text: last.text.clone(),
                        preview_is_ours: last.sender == Sender::Ours,
                    })
                })
                .collect();
            previews.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(previews)
        })
    }

    async fn open_contact(&self, name: &str) -> Result<bool, SurfaceError> {
        self.with_inner(|inner| {
            if let Some(err) = Self::session_error(inner) {
                return Err(err);
            }
            match inner.threads.get_mut(name) {
                Some(thread) => {
                    thread.unread = false;
                    inner.open = Some(name.to_string());
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn read_transcript(&self, name: &str) -> Result<Vec<RawMessage>, SurfaceError> {
        self.with_inner(|inner| {
            if let Some(err) = Self::session_error(inner) {
                return Err(err);
            }
            let Some(thread) = inner.threads.get_mut(name) else {
                return Ok(Vec::new());
            };
            thread.reads += 1;
            while let Some((at, _)) = thread.scheduled.front() {
                if *at > thread.reads {
                    break;
                }
                if let Some((_, text)) = thread.scheduled.pop_front() {
                    thread.messages.push(RawMessage::theirs(text));
                }
            }
            if thread.failing_reads > 0 {
                thread.failing_reads -= 1;
                return Ok(Vec::new());
            }
            Ok(thread.messages.clone())
        })
    }

    async fn send_message(&self, text: &str) -> Result<bool, SurfaceError> {
        self.with_inner(|inner| {
            if let Some(err) = Self::session_error(inner) {
                return Err(err);
            }
            if inner.failing_sends > 0 {
                inner.failing_sends -= 1;
                return Ok(false);
            }
            let Some(open) = inner.open.clone() else {
                return Ok(false);
            };
            if let Some(thread) = inner.threads.get_mut(&open) {
                thread.messages.push(RawMessage::ours(text));
            }
            inner.sent.push((open, text.to_string()));
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_goes_to_open_contact() {
        let surface = MemorySurface::new();
        surface.deliver("alice", "hi");
        assert!(!surface.send_message("nobody open").await.unwrap());
        assert!(surface.open_contact("alice").await.unwrap());
        assert!(surface.send_message("hello alice").await.unwrap());
        assert_eq!(surface.sent(), vec![("alice".into(), "hello alice".into())]);
        assert_eq!(surface.thread("alice").len(), 2);
    }

    #[tokio::test]
    async fn scheduled_inbound_lands_after_reads() {
        let surface = MemorySurface::new();
        surface.deliver("bob", "hey");
        surface.schedule_inbound("bob", 2, "you there?");
        assert_eq!(surface.read_transcript("bob").await.unwrap().len(), 1);
        assert_eq!(surface.read_transcript("bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn opening_clears_unread() {
        let surface = MemorySurface::new();
        surface.deliver("carol", "price?");
        assert_eq!(surface.list_unread().await.unwrap().len(), 1);
        surface.open_contact("carol").await.unwrap();
        assert!(surface.list_unread().await.unwrap().is_empty());
        assert!(!surface.open_contact("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn session_problem_fails_every_call() {
        let surface = MemorySurface::new();
        surface.set_session_problem(Some((SessionProblem::LoggedOut, "checkpoint")));
        assert!(surface.check_session().await.unwrap_err().is_session());
        assert!(surface.list_unread().await.unwrap_err().is_session());
    }
}
