//! Socket Mode connector: receive workspace events over a WebSocket without a public endpoint.
//!
//! Every envelope is acknowledged; `events_api` message events are forwarded to the gateway.

use crate::channels::inbound::{InboundEvent, InboundMessage};
use crate::channels::slack::SlackClient;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
}

/// The `event` object of an events_api payload (message events only use these fields).
#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    deleted_ts: Option<String>,
}

/// A Socket Mode frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Hello,
    /// Server asks us to reconnect (e.g. "refresh_requested").
    Disconnect { reason: Option<String> },
    /// events_api envelope; `event` is None when the event is not one the bridge handles.
    Events {
        envelope_id: String,
        event: Option<InboundEvent>,
    },
    /// Slash commands, interactions, etc. Acknowledged and ignored.
    Other {
        kind: String,
        envelope_id: Option<String>,
    },
}

impl Envelope {
    /// Envelope id that must be echoed back to acknowledge delivery.
    pub fn ack_id(&self) -> Option<&str> {
        match self {
            Envelope::Events { envelope_id, .. } => Some(envelope_id),
            Envelope::Other { envelope_id, .. } => envelope_id.as_deref(),
            Envelope::Hello | Envelope::Disconnect { .. } => None,
        }
    }
}

/// Parse a Socket Mode text frame.
pub fn parse_envelope(text: &str) -> Result<Envelope, serde_json::Error> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    Ok(match raw.kind.as_str() {
        "hello" => Envelope::Hello,
        "disconnect" => Envelope::Disconnect { reason: raw.reason },
        "events_api" => match raw.envelope_id {
            Some(envelope_id) => {
                let event = raw
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("event"))
                    .and_then(|e| serde_json::from_value::<SlackEvent>(e.clone()).ok())
                    .and_then(inbound_event);
                Envelope::Events { envelope_id, event }
            }
            None => Envelope::Other {
                kind: raw.kind,
                envelope_id: None,
            },
        },
        _ => Envelope::Other {
            kind: raw.kind,
            envelope_id: raw.envelope_id,
        },
    })
}

/// Map a Slack event to an inbound event. Edits, joins and bot posts are dropped here.
fn inbound_event(ev: SlackEvent) -> Option<InboundEvent> {
    if ev.kind != "message" {
        return None;
    }
    match ev.subtype.as_deref() {
        Some("message_deleted") => {
            return Some(InboundEvent::Retracted {
                channel: ev.channel?,
                ts: ev.deleted_ts?,
            })
        }
        None | Some("thread_broadcast") => {}
        Some(_) => return None,
    }
    if ev.bot_id.is_some() {
        return None;
    }
    Some(InboundEvent::Message(InboundMessage {
        channel: ev.channel?,
        thread_ts: ev.thread_ts,
        ts: ev.ts?,
        text: ev.text.unwrap_or_default(),
        user: ev.user,
    }))
}

/// How one WebSocket connection ended.
enum ConnectionEnd {
    /// Server closed or asked to reconnect.
    Reconnect,
    /// Connector stopped or gateway no longer receiving.
    Finished,
}

/// Socket Mode connector: opens connections via apps.connections.open and forwards events.
pub struct SocketModeConnector {
    slack: Arc<SlackClient>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl SocketModeConnector {
    pub fn new(slack: Arc<SlackClient>) -> Self {
        Self {
            slack,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the connect/receive loop and forward events to the gateway. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<InboundEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("slack socket mode: starting connection loop");
        tokio::spawn(async move {
            run_socket_loop(self, inbound_tx).await;
        })
    }

    /// Stop the connector; the current connection is closed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

async fn run_socket_loop(conn: Arc<SocketModeConnector>, inbound_tx: mpsc::Sender<InboundEvent>) {
    while conn.running() {
        match conn.slack.open_socket_url().await {
            Ok(url) => match run_connection(&conn, &url, &inbound_tx).await {
                Ok(ConnectionEnd::Finished) => break,
                Ok(ConnectionEnd::Reconnect) => {
                    log::debug!("slack socket mode: reconnecting");
                    continue;
                }
                Err(e) => log::warn!("slack socket mode connection error: {}", e),
            },
            Err(e) => log::warn!("slack apps.connections.open failed: {}", e),
        }
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    log::info!("slack socket mode: connection loop stopped");
}

async fn run_connection(
    conn: &SocketModeConnector,
    url: &str,
    inbound_tx: &mpsc::Sender<InboundEvent>,
) -> Result<ConnectionEnd, String> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| e.to_string())?;
    let (mut write, mut read) = ws.split();
    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(ConnectionEnd::Finished);
            }
            frame = read.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(ConnectionEnd::Reconnect);
        };
        let text = match frame.map_err(|e| e.to_string())? {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(ConnectionEnd::Reconnect),
            _ => continue,
        };
        let envelope = match parse_envelope(&text) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("slack socket mode: unparsable frame ({}): {}", e, text);
                continue;
            }
        };
        if let Some(id) = envelope.ack_id() {
            let ack = serde_json::json!({ "envelope_id": id }).to_string();
            write.send(Message::Text(ack)).await.map_err(|e| e.to_string())?;
        }
        match envelope {
            Envelope::Hello => log::info!("slack socket mode: connected"),
            Envelope::Disconnect { reason } => {
                log::info!(
                    "slack socket mode: disconnect requested ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                return Ok(ConnectionEnd::Reconnect);
            }
            Envelope::Events {
                event: Some(event), ..
            } => {
                if inbound_tx.send(event).await.is_err() {
                    log::debug!("slack socket mode: inbound channel closed, stopping loop");
                    return Ok(ConnectionEnd::Finished);
                }
            }
            Envelope::Events { event: None, .. } => {}
            Envelope::Other { kind, .. } => {
                log::debug!("slack socket mode: ignoring {} envelope", kind);
            }
        }
    }
}
