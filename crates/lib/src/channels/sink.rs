//! Message sink: the outward-facing side of a channel (post, edit, read a thread).

use async_trait::async_trait;

/// Errors from the workspace API.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: {0}")]
    Api(String),
}

/// One message of a thread as reported by the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
}

/// Posts and edits messages and reads thread transcripts. Implemented by the Slack client.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Post `text` as a reply in the thread rooted at `thread_ts`; returns the new message's ts.
    async fn post_message(&self, channel: &str, thread_ts: &str, text: &str) -> Result<String, SinkError>;

    /// Replace the text of message `ts`.
    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), SinkError>;

    /// All messages of the thread rooted at `root_ts`, oldest first (root included).
    async fn thread_messages(&self, channel: &str, root_ts: &str) -> Result<Vec<ThreadMessage>, SinkError>;
}
