//! Message bridge: decide whether a workspace message is for the agent, run the turn, and
//! keep track of turns in flight so a deleted message can cancel its turn.

use crate::agent::{self, AgentError, AgentRequest, Launcher, OutboundOp, TurnReport};
use crate::channels::{InboundEvent, InboundMessage, MessageSink, SinkError};
use crate::routing::{self, BotIdentity, ConversationKey, DropReason, Ownership, Route};
use crate::session::{Placeholders, ThreadGuard, ThreadRegistry};
use crate::transcript::{self, Reconstruction, TranscriptError, TranscriptMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("posting to the thread failed: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Launch(#[from] AgentError),
}

/// What happened to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dropped(DropReason),
    /// Deleted before its turn started.
    Withdrawn,
    Answered(TurnReport),
}

type MessageId = (String, String);

/// Routes inbound messages to agent turns. Share it behind an `Arc`.
pub struct Bridge {
    bot: BotIdentity,
    registry: Arc<ThreadRegistry>,
    sink: Arc<dyn MessageSink>,
    launcher: Arc<dyn Launcher>,
    placeholders: Placeholders,
    turn_timeout: Duration,
    shutdown: CancellationToken,
    next_turn: AtomicU64,
    in_flight: Mutex<HashMap<MessageId, (u64, CancellationToken)>>,
}

/// Registration of a message in the in-flight table; removed on drop.
struct InFlight<'a> {
    bridge: &'a Bridge,
    id: MessageId,
    seq: u64,
    cancel: CancellationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.bridge.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&self.id).is_some_and(|(seq, _)| *seq == self.seq) {
            map.remove(&self.id);
        }
    }
}

impl Bridge {
    pub fn new(
        bot: BotIdentity,
        registry: Arc<ThreadRegistry>,
        sink: Arc<dyn MessageSink>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            bot,
            registry,
            sink,
            launcher,
            placeholders: Placeholders::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            shutdown: CancellationToken::new(),
            next_turn: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_placeholders(mut self, placeholders: Placeholders) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn bot(&self) -> &BotIdentity {
        &self.bot
    }

    /// Messages accepted and not yet finished (waiting for their thread or running).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Handle one event and log the result.
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(msg) => {
                let label = format!("{}/{}", msg.channel, msg.ts);
                match self.handle_message(msg).await {
                    Ok(Outcome::Dropped(reason)) => log::debug!("message {}: dropped ({})", label, reason),
                    Ok(Outcome::Withdrawn) => log::info!("message {}: withdrawn before its turn", label),
                    Ok(Outcome::Answered(report)) => log::info!(
                        "message {}: turn done ({} replies{})",
                        label,
                        report.replies,
                        match report.interrupted {
                            Some(agent::Interruption::TimedOut) => ", timed out",
                            Some(agent::Interruption::Withdrawn) => ", withdrawn",
                            None => "",
                        }
                    ),
                    Err(e) => log::error!("message {}: {}", label, e),
                }
            }
            InboundEvent::Retracted { channel, ts } => {
                self.retract(&channel, &ts);
            }
        }
    }

    /// Cancel the turn triggered by a deleted message. Returns false if none is in flight.
    pub fn retract(&self, channel: &str, ts: &str) -> bool {
        let map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(&(channel.to_string(), ts.to_string())) {
            Some((_, cancel)) => {
                log::info!("message {}/{}: deleted, cancelling its turn", channel, ts);
                cancel.cancel();
                true
            }
            None => {
                log::debug!("message {}/{}: deleted, nothing in flight", channel, ts);
                false
            }
        }
    }

    /// Cancel every turn, current and future. Used on shutdown.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    fn register(&self, msg: &InboundMessage) -> InFlight<'_> {
        let seq = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let id = (msg.channel.clone(), msg.ts.clone());
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (seq, cancel.clone()));
        InFlight {
            bridge: self,
            id,
            seq,
            cancel,
        }
    }

    /// Route one message and, when it is for the agent, run its turn to completion.
    ///
    /// Messages in the same thread are handled one at a time, in the order they reach the thread lock.
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<Outcome, BridgeError> {
        let addressed = match routing::address(&msg, &self.bot) {
            Ok(a) => a,
            Err(reason) => return Ok(Outcome::Dropped(reason)),
        };
        let in_thread = msg.in_thread();
        let key = ConversationKey::for_message(&msg);
        // Decisions that need no thread state are made before touching the registry.
        if let Route::Drop(reason) = routing::classify(in_thread, addressed.addressed, self.registry.ownership(&key)) {
            return Ok(Outcome::Dropped(reason));
        }

        let turn = self.register(&msg);
        let mut thread = self.registry.lock(&key).await;
        if turn.cancel.is_cancelled() {
            return Ok(Outcome::Withdrawn);
        }
        let context = match self.admit(&mut thread, &msg, in_thread, addressed.addressed).await? {
            Ok(context) => context,
            Err(reason) => return Ok(Outcome::Dropped(reason)),
        };

        let prompt = transcript::compose_prompt(&context, &addressed.text);
        let placeholder_text = thread.record_turn_start(&self.placeholders);
        let placeholder_ts = self
            .sink
            .post_message(&key.channel, &key.root_ts, &placeholder_text)
            .await?;
        thread.record_placeholder(placeholder_ts.clone());

        let request = AgentRequest {
            prompt,
            resume: thread.continuation_token().map(String::from),
        };
        log::info!(
            "thread {}: starting turn ({})",
            key,
            match request.resume {
                Some(ref token) => format!("resuming {}", token),
                None => "new session".to_string(),
            }
        );
        let process = match self.launcher.launch(&request) {
            Ok(p) => p,
            Err(e) => {
                let notice = format!(
                    "something went wrong: the agent could not be started ({}). check the bridge logs for details.",
                    e
                );
                agent::deliver(
                    self.sink.as_ref(),
                    &mut thread,
                    OutboundOp::Replace {
                        ts: placeholder_ts,
                        text: notice,
                    },
                )
                .await;
                return Err(BridgeError::Launch(e));
            }
        };
        let report = agent::run_turn(
            process,
            &mut thread,
            self.sink.as_ref(),
            Some(placeholder_ts),
            self.turn_timeout,
            &turn.cancel,
        )
        .await;
        Ok(Outcome::Answered(report))
    }

    /// Classify the thread under its lock. Returns the transcript to send along on the first
    /// turn of a thread joined mid-conversation, or the reason to drop the message.
    async fn admit(
        &self,
        thread: &mut ThreadGuard,
        msg: &InboundMessage,
        in_thread: bool,
        addressed: bool,
    ) -> Result<Result<Vec<TranscriptMessage>, DropReason>, BridgeError> {
        let key = thread.key().clone();
        match routing::classify(in_thread, addressed, thread.ownership()) {
            Route::Drop(reason) => Ok(Err(reason)),
            Route::Start => {
                if thread.ownership() != Ownership::Owned {
                    log::info!("thread {}: new conversation", key);
                }
                thread.mark_owned(false);
                Ok(Ok(Vec::new()))
            }
            Route::Continue => Ok(Ok(Vec::new())),
            Route::Promote => {
                log::info!("thread {}: bot addressed in an ignored thread, joining", key);
                thread.mark_owned(false);
                Ok(Ok(Vec::new()))
            }
            Route::Reconstruct => {
                match transcript::reconstruct(self.sink.as_ref(), &key, &self.bot, &msg.ts).await {
                    Ok(Reconstruction::Owned(context)) => {
                        thread.mark_owned(true);
                        Ok(Ok(context))
                    }
                    Ok(Reconstruction::Rejected) => {
                        thread.mark_rejected();
                        Ok(Err(DropReason::Rejected))
                    }
                    // Ownership stays unknown so the next message retries the scan.
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}
