//! Turn stream reducer: folds agent output lines into outbound operations on the thread.
//!
//! The first text reply replaces the "thinking" placeholder; later text replies are posted as
//! new thread messages. A continuation token is taken from the first system event of the turn.

use super::event::{decode_line, AgentEvent};
use super::invoke::AgentExit;

/// An operation on the thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOp {
    /// Edit the placeholder message in place.
    Replace { ts: String, text: String },
    /// Post a new message in the thread.
    Post { text: String },
}

/// Effect of one output line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// Continuation token to store for the thread.
    pub token: Option<String>,
    pub op: Option<OutboundOp>,
}

/// Why a turn ended before the agent finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    TimedOut,
    /// The triggering message was deleted, or the bridge is shutting down.
    Withdrawn,
}

/// Per-turn state: pending placeholder, whether a token was already recorded, reply count.
#[derive(Debug)]
pub struct StreamReducer {
    label: String,
    placeholder: Option<String>,
    session_id: Option<String>,
    replies: usize,
    skipped: usize,
}

impl StreamReducer {
    /// `label` names the thread in logs; `placeholder` is the ts of the message to replace first.
    pub fn new(label: impl Into<String>, placeholder: Option<String>) -> Self {
        Self {
            label: label.into(),
            placeholder,
            session_id: None,
            replies: 0,
            skipped: 0,
        }
    }

    pub fn replies(&self) -> usize {
        self.replies
    }

    /// Lines that were blank, malformed, or carried no type.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn placeholder_pending(&self) -> bool {
        self.placeholder.is_some()
    }

    pub fn apply(&mut self, line: &str) -> Step {
        let line = line.trim();
        if line.is_empty() {
            return Step::default();
        }
        let event = match decode_line(line) {
            Ok(event) => event,
            Err(e) => {
                self.skipped += 1;
                log::warn!("agent [{}]: skipping line ({}): {}", self.label, e, truncate(line, 200));
                return Step::default();
            }
        };
        match event {
            AgentEvent::System {
                session_id: Some(id),
            } => {
                if let Some(ref current) = self.session_id {
                    if *current != id {
                        log::debug!(
                            "agent [{}]: ignoring later session id {} (keeping {})",
                            self.label,
                            id,
                            current
                        );
                    }
                    return Step::default();
                }
                log::info!("agent [{}]: session {}", self.label, id);
                self.session_id = Some(id.clone());
                Step {
                    token: Some(id),
                    op: None,
                }
            }
            AgentEvent::System { session_id: None } => Step::default(),
            AgentEvent::AssistantText(text) if text.trim().is_empty() => {
                log::debug!("agent [{}]: blank text block not forwarded", self.label);
                Step::default()
            }
            AgentEvent::AssistantText(text) => {
                self.replies += 1;
                let op = match self.placeholder.take() {
                    Some(ts) => OutboundOp::Replace { ts, text },
                    None => OutboundOp::Post { text },
                };
                Step { token: None, op: Some(op) }
            }
            AgentEvent::AssistantOther { block_type } => {
                log::debug!(
                    "agent [{}]: assistant {} block not forwarded",
                    self.label,
                    block_type.as_deref().unwrap_or("empty")
                );
                Step::default()
            }
            AgentEvent::Unknown { kind } => {
                log::debug!("agent [{}]: ignoring {} event", self.label, kind);
                Step::default()
            }
        }
    }

    /// Undo the bookkeeping for an operation the sink could not deliver at all.
    ///
    /// A failed `Replace` leaves the placeholder pending, so the next reply or `finish` retries it.
    pub fn undelivered(&mut self, op: OutboundOp) {
        self.replies = self.replies.saturating_sub(1);
        if let OutboundOp::Replace { ts, .. } = op {
            if self.placeholder.is_none() {
                self.placeholder = Some(ts);
            }
        }
    }

    /// Resolve a placeholder that is still pending when the stream ends.
    ///
    /// Returns a `Replace` carrying a short failure notice, or None when a reply already replaced it.
    pub fn finish(&mut self, exit: &AgentExit, interrupted: Option<Interruption>) -> Option<OutboundOp> {
        let ts = self.placeholder.take()?;
        let text = failure_notice(exit, interrupted);
        log::warn!("agent [{}]: no reply, resolving placeholder: {}", self.label, text);
        Some(OutboundOp::Replace { ts, text })
    }
}

fn failure_notice(exit: &AgentExit, interrupted: Option<Interruption>) -> String {
    match interrupted {
        Some(Interruption::TimedOut) => {
            "sorry, that took too long and I had to stop. please try again.".to_string()
        }
        Some(Interruption::Withdrawn) => "request withdrawn, stopped working on it.".to_string(),
        None => match exit.code {
            Some(0) if !exit.killed => "I finished without anything to say. try rephrasing?".to_string(),
            Some(code) => format!(
                "something went wrong: the agent exited with code {}. check the bridge logs for details.",
                code
            ),
            None => "something went wrong: the agent was terminated. check the bridge logs for details."
                .to_string(),
        },
    }
}

/// Shorten a line for logging, on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
