//! Thread routing: conversation keys and the mention detector.
//!
//! A message belongs to a bot-owned conversation when it starts a new thread by addressing
//! the bot, or when its thread is already known to be owned. Unknown threads are deferred to
//! the transcript scan in [`crate::transcript`].

use crate::channels::InboundMessage;
use std::fmt;

/// Identity of one thread: channel id plus the root message timestamp.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConversationKey {
    pub channel: String,
    pub root_ts: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, root_ts: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            root_ts: root_ts.into(),
        }
    }

    /// Key for the thread a message belongs to; a root message keys its own (future) thread.
    pub fn for_message(msg: &InboundMessage) -> Self {
        let root = msg.thread_ts.as_deref().unwrap_or(&msg.ts);
        Self::new(msg.channel.clone(), root)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.root_ts)
    }
}

/// Whether the bot participates in a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Not classified yet.
    Unknown,
    Owned,
    Rejected,
}

/// The bot's own user id and the address marker derived from it (`<@U123>`).
#[derive(Debug, Clone)]
pub struct BotIdentity {
    user_id: String,
    marker: String,
}

impl BotIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let marker = format!("<@{}>", user_id);
        Self { user_id, marker }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// True if the text begins with the address marker.
    pub fn addresses(&self, text: &str) -> bool {
        text.starts_with(&self.marker)
    }

    /// Text after the address marker, trimmed. None when the text does not address the bot.
    pub fn strip_address<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.strip_prefix(self.marker.as_str()).map(str::trim)
    }

    /// True if the message was authored by the bot.
    pub fn is_author(&self, user: Option<&str>) -> bool {
        user == Some(self.user_id.as_str())
    }
}

/// Why a message is not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Posted by the bot itself.
    OwnMessage,
    /// Nothing left to send after removing the address marker.
    Empty,
    /// Root message that does not address the bot.
    NotAddressed,
    /// Thread known not to involve the bot.
    Rejected,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::OwnMessage => "own message",
            DropReason::Empty => "empty message",
            DropReason::NotAddressed => "not addressed to the bot",
            DropReason::Rejected => "thread not owned",
        };
        f.write_str(s)
    }
}

/// A message reduced to what the agent should see and whether it addressed the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressed {
    pub text: String,
    pub addressed: bool,
}

/// First, registry-free pass over a message: drop the bot's own posts and empty text, strip the marker.
pub fn address(msg: &InboundMessage, bot: &BotIdentity) -> Result<Addressed, DropReason> {
    if bot.is_author(msg.user.as_deref()) {
        return Err(DropReason::OwnMessage);
    }
    let (text, addressed) = match bot.strip_address(&msg.text) {
        Some(rest) => (rest, true),
        None => (msg.text.trim(), false),
    };
    if text.is_empty() {
        return Err(DropReason::Empty);
    }
    Ok(Addressed {
        text: text.to_string(),
        addressed,
    })
}

/// What to do with a message given the cached ownership of its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Root message addressing the bot: a new owned thread.
    Start,
    /// Thread already owned.
    Continue,
    /// Thread cached as rejected, but this message addresses the bot.
    Promote,
    /// Unknown thread: scan its transcript.
    Reconstruct,
    Drop(DropReason),
}

/// Classify a message. Pure: the caller applies the result to the registry.
pub fn classify(in_thread: bool, addressed: bool, ownership: Ownership) -> Route {
    if !in_thread {
        return if addressed {
            Route::Start
        } else {
            Route::Drop(DropReason::NotAddressed)
        };
    }
    match ownership {
        Ownership::Owned => Route::Continue,
        Ownership::Rejected if addressed => Route::Promote,
        Ownership::Rejected => Route::Drop(DropReason::Rejected),
        Ownership::Unknown => Route::Reconstruct,
    }
}
