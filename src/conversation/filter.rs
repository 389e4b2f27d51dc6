//! Noise filters for scraped transcripts.
//!
//! The surface hands over everything it rendered in the thread, including
//! timestamps, read receipts, typing indicators and platform notices. None
//! of that is conversation content, and letting it through would flip the
//! fingerprint on every re-render.
//!
//! Filters are independent predicates so new patterns can be added and
//! tested without touching the state machine.

use regex::Regex;
use tracing::trace;

use crate::conversation::model::Sender;

/// A predicate that recognises non-content lines.
pub trait MessageFilter: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Whether this line is noise and should be dropped.
    fn is_noise(&self, sender: Sender, text: &str) -> bool;
}

/// Drops blank lines.
pub struct EmptyFilter;

impl MessageFilter for EmptyFilter {
    fn name(&self) -> &str {
        "empty"
    }

    fn is_noise(&self, _sender: Sender, text: &str) -> bool {
        text.trim().is_empty()
    }
}

/// A regex matched against the whole trimmed line.
pub struct RegexFilter {
    name: String,
    regex: Regex,
    /// Only apply to lines from this side, if set.
    sender: Option<Sender>,
}

impl RegexFilter {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            regex: Regex::new(pattern)?,
            sender: None,
        })
    }

    /// Restrict the filter to one side of the conversation.
    pub fn for_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }
}

impl MessageFilter for RegexFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_noise(&self, sender: Sender, text: &str) -> bool {
        if let Some(only) = self.sender
            && only != sender
        {
            return false;
        }
        self.regex.is_match(text.trim())
    }
}

/// Ordered set of filters. A line is noise if any filter says so.
pub struct FilterSet {
    filters: Vec<Box<dyn MessageFilter>>,
}

impl FilterSet {
    /// Filters for the timestamps and notices a DM inbox typically renders.
    pub fn default_filters() -> Self {
        let mut set = Self::empty();
        set.push(Box::new(EmptyFilter));

        let rules: &[(&str, &str)] = &[
            // "12:45", "9:03 PM", "Yesterday at 3:10 PM", "Mon 14:02"
            (
                "timestamp",
                r"(?i)^((today|yesterday|mon|tue|wed|thu|fri|sat|sun)[a-z]*( at)? )?\d{1,2}:\d{2}( ?[ap]m)?$",
            ),
            // "12/03/2025, 14:02" or "3 March 2025"
            (
                "date",
                r"(?i)^(\d{1,2}/\d{1,2}/\d{2,4}(,? \d{1,2}:\d{2}( ?[ap]m)?)?|\d{1,2} [a-z]+ \d{4}( at \d{1,2}:\d{2})?)$",
            ),
            ("read_receipt", r"(?i)^(seen|delivered|sent|read)( \d+\w* ago| by .+)?$"),
            ("presence", r"(?i)^(active now|active \d+\s?\w+ ago|online)$"),
            ("typing", r"(?i)^.{0,40}(is )?typing(\.\.\.|…)?$"),
            ("you_sent", r"(?i)^you sent (an? )?(attachment|photo|sticker|gif|video|voice message)\.?$"),
            (
                "system_notice",
                r"(?i)^(you are now connected on messenger|you can now message and call each other.*|this person is unavailable.*|.*missed (your )?(a )?(video |audio )?call.*|you (replied|reacted) to .*|.* unsent a message)$",
            ),
        ];

        for (name, pattern) in rules {
            match RegexFilter::new(*name, pattern) {
                Ok(filter) => set.push(Box::new(filter)),
                Err(e) => tracing::warn!(filter = name, error = %e, "Invalid built-in filter"),
            }
        }
        set
    }

    /// No filters at all (for tests).
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: Box<dyn MessageFilter>) {
        self.filters.push(filter);
    }

    /// Add a custom regex rule.
    pub fn add_rule(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        self.push(Box::new(RegexFilter::new(name, pattern)?));
        Ok(())
    }

    pub fn is_noise(&self, sender: Sender, text: &str) -> bool {
        match self.filters.iter().find(|f| f.is_noise(sender, text)) {
            Some(filter) => {
                trace!(filter = filter.name(), "Dropping noise line");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::default_filters()
    }
}
