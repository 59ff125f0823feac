//! Workspace channel (Slack).
//!
//! The Web API client implements [`MessageSink`]; the Socket Mode connector turns
//! pushed events into [`InboundEvent`]s for the gateway.

mod inbound;
mod sink;
mod slack;
mod socket;

pub use inbound::{InboundEvent, InboundMessage};
pub use sink::{MessageSink, SinkError, ThreadMessage};
pub use slack::SlackClient;
pub use socket::{parse_envelope, Envelope, SocketModeConnector};
