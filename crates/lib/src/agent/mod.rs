//! Agent turns: launch the agent CLI, stream its output into the thread, and resolve the placeholder.

mod event;
mod invoke;
mod reducer;

pub use event::{decode_line, AgentEvent, DecodeError};
pub use invoke::{AgentCommand, AgentError, AgentExit, AgentProcess, AgentRequest, Launcher};
pub use reducer::{Interruption, OutboundOp, Step, StreamReducer};

use crate::channels::MessageSink;
use crate::session::ThreadGuard;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Summary of a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Text replies delivered to the thread.
    pub replies: usize,
    pub session_id: Option<String>,
    pub exit: AgentExit,
    pub interrupted: Option<Interruption>,
}

/// Drive one agent process to completion for the thread held by `thread`.
///
/// Lines are applied in arrival order. The turn ends when the agent process exits, when
/// `timeout` elapses, or when `cancel` fires; in the latter two cases the process is killed.
/// A placeholder still pending at the end is replaced with a failure notice.
pub async fn run_turn(
    mut process: AgentProcess,
    thread: &mut ThreadGuard,
    sink: &dyn MessageSink,
    placeholder: Option<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TurnReport {
    let key = thread.key().clone();
    let mut reducer = StreamReducer::new(key.to_string(), placeholder);
    let deadline = Instant::now() + timeout;
    let mut interrupted = None;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                interrupted = Some(Interruption::Withdrawn);
                break;
            }
            next = tokio::time::timeout_at(deadline, process.next_line()) => match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => {
                    log::warn!("agent [{}]: no result after {:?}, stopping", key, timeout);
                    interrupted = Some(Interruption::TimedOut);
                    break;
                }
            },
        };
        log::debug!("agent [{}] <- {}", key, reducer::truncate(line.trim(), 500));
        let step = reducer.apply(&line);
        if let Some(token) = step.token {
            thread.record_token(token);
        }
        if let Some(op) = step.op {
            if !deliver(sink, thread, op.clone()).await {
                reducer.undelivered(op);
            }
        }
    }
    if interrupted.is_some() {
        process.cancel();
    }
    // Output closed, but the process may still be running; the deadline and cancel apply until it exits.
    let kill = process.kill_switch();
    let wait = process.wait();
    tokio::pin!(wait);
    let exit = tokio::select! {
        exit = &mut wait => exit,
        _ = cancel.cancelled(), if interrupted.is_none() => {
            interrupted = Some(Interruption::Withdrawn);
            kill.cancel();
            wait.await
        }
        _ = tokio::time::sleep_until(deadline), if interrupted.is_none() => {
            log::warn!("agent [{}]: still running {:?} after closing its output, stopping", key, timeout);
            interrupted = Some(Interruption::TimedOut);
            kill.cancel();
            wait.await
        }
    };
    for line in &exit.stderr {
        log::warn!("agent [{}] stderr: {}", key, line);
    }
    match exit.code {
        Some(code) => log::info!("agent [{}]: exited with code {}", key, code),
        None => log::info!("agent [{}]: terminated without exit code", key),
    }
    if let Some(op) = reducer.finish(&exit, interrupted) {
        deliver(sink, thread, op).await;
    }
    TurnReport {
        replies: reducer.replies(),
        session_id: reducer.session_id().map(String::from),
        exit,
        interrupted,
    }
}

/// Apply an outbound operation. A failed placeholder edit falls back to posting the text.
///
/// Returns false when nothing reached the thread; the placeholder then stays pending.
pub async fn deliver(sink: &dyn MessageSink, thread: &mut ThreadGuard, op: OutboundOp) -> bool {
    let key = thread.key().clone();
    match op {
        OutboundOp::Replace { ts, text } => {
            let delivered = match sink.update_message(&key.channel, &ts, &text).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("thread {}: replacing placeholder failed ({}), posting instead", key, e);
                    match sink.post_message(&key.channel, &key.root_ts, &text).await {
                        Ok(_) => true,
                        Err(e) => {
                            log::error!("thread {}: posting reply failed, placeholder left pending: {}", key, e);
                            false
                        }
                    }
                }
            };
            if delivered {
                thread.clear_placeholder();
            }
            delivered
        }
        OutboundOp::Post { text } => match sink.post_message(&key.channel, &key.root_ts, &text).await {
            Ok(_) => true,
            Err(e) => {
                log::error!("thread {}: posting reply failed: {}", key, e);
                false
            }
        },
    }
}
