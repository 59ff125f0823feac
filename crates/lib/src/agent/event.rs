//! Agent stream events: one JSON object per stdout line.

use serde::Deserialize;
use serde_json::Value;

/// A decoded agent output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Session bookkeeping; carries the continuation token when present.
    System { session_id: Option<String> },
    /// Assistant message whose first content block is text.
    AssistantText(String),
    /// Assistant message without a leading text block (tool use, thinking, or no content).
    AssistantOther { block_type: Option<String> },
    /// Any other event kind (user, result, ...).
    Unknown { kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed line: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("line has no event type")]
    MissingType,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Decode one non-blank line.
pub fn decode_line(line: &str) -> Result<AgentEvent, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    Ok(match kind {
        "system" => AgentEvent::System {
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
        },
        "assistant" => decode_assistant(value.get("message")),
        other => AgentEvent::Unknown {
            kind: other.to_string(),
        },
    })
}

fn decode_assistant(message: Option<&Value>) -> AgentEvent {
    let first = message
        .and_then(|m| serde_json::from_value::<AssistantMessage>(m.clone()).ok())
        .and_then(|m| m.content.into_iter().next());
    let Some(first) = first else {
        return AgentEvent::AssistantOther { block_type: None };
    };
    match serde_json::from_value::<ContentBlock>(first) {
        Ok(ContentBlock {
            kind: Some(kind),
            text: Some(text),
        }) if kind == "text" => AgentEvent::AssistantText(text),
        Ok(block) => AgentEvent::AssistantOther { block_type: block.kind },
        Err(_) => AgentEvent::AssistantOther { block_type: None },
    }
}
