//! Thread transcript: decide whether an unknown thread involves the bot and rebuild its
//! earlier turns so the agent can pick the conversation up mid-way.

use crate::channels::{MessageSink, ThreadMessage};
use crate::routing::{BotIdentity, ConversationKey};
use serde::Serialize;

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Speaker {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Agent,
}

/// One earlier turn of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptMessage {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript unavailable for thread {key}: {reason}")]
    Unavailable { key: ConversationKey, reason: String },
}

/// Result of scanning a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconstruction {
    /// The bot took part or was addressed; earlier turns for context.
    Owned(Vec<TranscriptMessage>),
    Rejected,
}

/// Classify a thread from its messages (oldest first).
///
/// Owned when any message was written by the bot or starts with its address marker. The
/// transcript skips empty messages and the message currently being handled (`current_ts`),
/// which is sent to the agent separately.
pub fn scan(messages: &[ThreadMessage], bot: &BotIdentity, current_ts: &str) -> Reconstruction {
    let mut owned = false;
    let mut transcript = Vec::new();
    for message in messages {
        let by_bot = bot.is_author(message.user.as_deref());
        if by_bot || bot.addresses(&message.text) {
            owned = true;
        }
        if message.text.is_empty() || message.ts == current_ts {
            continue;
        }
        transcript.push(TranscriptMessage {
            speaker: if by_bot { Speaker::Agent } else { Speaker::User },
            text: message.text.clone(),
        });
    }
    if owned {
        Reconstruction::Owned(transcript)
    } else {
        Reconstruction::Rejected
    }
}

/// Fetch a thread from the sink and classify it. No messages (or a failed fetch) is an error.
pub async fn reconstruct(
    sink: &dyn MessageSink,
    key: &ConversationKey,
    bot: &BotIdentity,
    current_ts: &str,
) -> Result<Reconstruction, TranscriptError> {
    let messages = sink
        .thread_messages(&key.channel, &key.root_ts)
        .await
        .map_err(|e| TranscriptError::Unavailable {
            key: key.clone(),
            reason: e.to_string(),
        })?;
    if messages.is_empty() {
        return Err(TranscriptError::Unavailable {
            key: key.clone(),
            reason: "no messages returned".to_string(),
        });
    }
    let result = scan(&messages, bot, current_ts);
    match &result {
        Reconstruction::Owned(context) => log::info!(
            "thread {}: joining previous conversation ({} earlier messages)",
            key,
            context.len()
        ),
        Reconstruction::Rejected => log::debug!("thread {}: bot not involved, ignoring", key),
    }
    Ok(result)
}

/// Message sent to the agent on the first turn of a thread joined mid-conversation.
pub fn compose_prompt(context: &[TranscriptMessage], text: &str) -> String {
    if context.is_empty() {
        return text.to_string();
    }
    let context_json = serde_json::to_string_pretty(context).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are continuing a conversation with the user. Here is the context:\n{}\n\nThe user just said:\n{}",
        context_json, text
    )
}
