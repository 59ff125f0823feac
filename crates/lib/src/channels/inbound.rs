//! Inbound events from the workspace: delivered to the gateway for thread/agent handling.

/// A message posted in a channel, possibly inside a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    /// Root timestamp when the message is a thread reply.
    pub thread_ts: Option<String>,
    pub ts: String,
    pub text: String,
    pub user: Option<String>,
}

impl InboundMessage {
    /// True for replies inside an existing thread. A thread parent may carry `thread_ts == ts`; that is not a reply.
    pub fn in_thread(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|t| t != self.ts)
    }
}

/// Events the bridge reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// A message was deleted; an in-flight turn it triggered is cancelled.
    Retracted { channel: String, ts: String },
}
