//! Bridge scenarios against an in-memory workspace and a scripted agent.

use async_trait::async_trait;
use lib::agent::{AgentError, AgentExit, AgentProcess, AgentRequest, Interruption, Launcher};
use lib::bridge::{Bridge, BridgeError, Outcome};
use lib::channels::{InboundMessage, MessageSink, SinkError, ThreadMessage};
use lib::routing::{BotIdentity, ConversationKey, DropReason, Ownership};
use lib::session::{Placeholders, RegistryStats, ThreadRegistry};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Post { thread_ts: String, ts: String, text: String },
    Update { ts: String, text: String },
}

#[derive(Default)]
struct FakeSink {
    sent: Mutex<Vec<Sent>>,
    threads: Mutex<HashMap<String, Vec<ThreadMessage>>>,
    fetches: AtomicUsize,
    fail_updates: AtomicBool,
    /// Number of upcoming post or update calls that fail.
    outage: AtomicUsize,
    next_ts: AtomicU64,
}

impl FakeSink {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn in_outage(&self) -> bool {
        self.outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn seed_thread(&self, root_ts: &str, messages: &[(&str, &str, &str)]) {
        let messages = messages
            .iter()
            .map(|(ts, user, text)| ThreadMessage {
                ts: ts.to_string(),
                user: Some(user.to_string()),
                text: text.to_string(),
            })
            .collect();
        self.threads.lock().unwrap().insert(root_ts.to_string(), messages);
    }
}

#[async_trait]
impl MessageSink for FakeSink {
    async fn post_message(&self, _channel: &str, thread_ts: &str, text: &str) -> Result<String, SinkError> {
        if self.in_outage() {
            return Err(SinkError::Api("chat.postMessage returned service_unavailable".to_string()));
        }
        let ts = format!("9.{}", self.next_ts.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().unwrap().push(Sent::Post {
            thread_ts: thread_ts.to_string(),
            ts: ts.clone(),
            text: text.to_string(),
        });
        Ok(ts)
    }

    async fn update_message(&self, _channel: &str, ts: &str, text: &str) -> Result<(), SinkError> {
        if self.in_outage() {
            return Err(SinkError::Api("chat.update returned service_unavailable".to_string()));
        }
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SinkError::Api("chat.update returned cant_update_message".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Update {
            ts: ts.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn thread_messages(&self, _channel: &str, root_ts: &str) -> Result<Vec<ThreadMessage>, SinkError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.threads.lock().unwrap().get(root_ts).cloned().unwrap_or_default())
    }
}

enum Script {
    Lines(Vec<String>, i32),
    /// Output fed by the test through `ScriptedLauncher::feeds`.
    Manual,
    FailLaunch,
}

#[derive(Default)]
struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<AgentRequest>>,
    feeds: Mutex<Vec<mpsc::Sender<String>>>,
}

impl ScriptedLauncher {
    fn with(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, request: &AgentRequest) -> Result<AgentProcess, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Lines(Vec::new(), 0));
        match script {
            Script::Lines(lines, code) => Ok(AgentProcess::scripted(lines, exit(code))),
            Script::Manual => {
                let (tx, process) = AgentProcess::channel(exit(0));
                self.feeds.lock().unwrap().push(tx);
                Ok(process)
            }
            Script::FailLaunch => Err(AgentError::Launch {
                program: "claude".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
            }),
        }
    }
}

fn exit(code: i32) -> AgentExit {
    AgentExit {
        code: Some(code),
        ..AgentExit::default()
    }
}

fn system(id: &str) -> String {
    serde_json::json!({ "type": "system", "subtype": "init", "session_id": id }).to_string()
}

fn text(t: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": { "content": [{ "type": "text", "text": t }] }
    })
    .to_string()
}

fn root(ts: &str, body: &str) -> InboundMessage {
    InboundMessage {
        channel: "C1".to_string(),
        thread_ts: None,
        ts: ts.to_string(),
        text: body.to_string(),
        user: Some("U1".to_string()),
    }
}

fn reply(root_ts: &str, ts: &str, body: &str) -> InboundMessage {
    InboundMessage {
        thread_ts: Some(root_ts.to_string()),
        ..root(ts, body)
    }
}

fn bridge(sink: &Arc<FakeSink>, launcher: &Arc<ScriptedLauncher>) -> Bridge {
    Bridge::new(
        BotIdentity::new("UBOT"),
        Arc::new(ThreadRegistry::default()),
        sink.clone(),
        launcher.clone(),
    )
    .with_placeholders(Placeholders::new(vec!["thinking hard".to_string()], "still thinking"))
}

fn key(root_ts: &str) -> ConversationKey {
    ConversationKey::new("C1", root_ts)
}

async fn wait_for_launches(launcher: &ScriptedLauncher, n: usize) {
    for _ in 0..200 {
        if launcher.requests.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent was not launched {} time(s)", n);
}

fn last_update(sink: &FakeSink) -> String {
    match sink.sent().last() {
        Some(Sent::Update { text, .. }) => text.clone(),
        other => panic!("expected an update, got {:?}", other),
    }
}

#[tokio::test]
async fn mention_starts_thread_and_reply_replaces_placeholder() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![system("abc123"), text("4")], 0)]);
    let bridge = bridge(&sink, &launcher);

    let outcome = bridge.handle_message(root("1.0", "<@UBOT> what is 2+2?")).await.unwrap();
    assert!(matches!(outcome, Outcome::Answered(ref r) if r.replies == 1));

    assert_eq!(
        launcher.requests(),
        vec![AgentRequest {
            prompt: "what is 2+2?".to_string(),
            resume: None
        }]
    );
    assert_eq!(
        sink.sent(),
        vec![
            Sent::Post {
                thread_ts: "1.0".to_string(),
                ts: "9.1".to_string(),
                text: "thinking hard".to_string()
            },
            Sent::Update {
                ts: "9.1".to_string(),
                text: "4".to_string()
            },
        ]
    );
    assert_eq!(bridge.registry().ownership(&key("1.0")), Ownership::Owned);
    let state = bridge.registry().snapshot(&key("1.0")).await.unwrap();
    assert_eq!(state.continuation_token.as_deref(), Some("abc123"));
    assert_eq!(state.pending_placeholder, None);
    assert!(state.has_posted_first_reply);
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn follow_up_resumes_session_without_refetching() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![
        Script::Lines(vec![system("abc123"), text("4")], 0),
        Script::Lines(vec![system("abc123"), text("5")], 0),
    ]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(root("1.0", "<@UBOT> what is 2+2?")).await.unwrap();
    bridge.handle_message(reply("1.0", "2.0", "and 2+3?")).await.unwrap();

    let requests = launcher.requests();
    assert_eq!(requests[1].prompt, "and 2+3?");
    assert_eq!(requests[1].resume.as_deref(), Some("abc123"));
    assert!(sink.sent().contains(&Sent::Post {
        thread_ts: "1.0".to_string(),
        ts: "9.2".to_string(),
        text: "still thinking".to_string()
    }));
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn later_replies_are_posted_as_new_messages() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![text("looking..."), text("found it")], 0)]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(root("1.0", "<@UBOT> find the host")).await.unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent[1],
        Sent::Update {
            ts: "9.1".to_string(),
            text: "looking...".to_string()
        }
    );
    assert!(matches!(sent[2], Sent::Post { ref thread_ts, ref text, .. } if thread_ts == "1.0" && text == "found it"));
}

#[tokio::test]
async fn unrelated_thread_is_rejected_and_silent() {
    let sink = Arc::new(FakeSink::default());
    sink.seed_thread("5.0", &[("5.0", "U1", "lunch?"), ("6.0", "U2", "sure")]);
    let launcher = ScriptedLauncher::with(Vec::new());
    let bridge = bridge(&sink, &launcher);

    let outcome = bridge.handle_message(reply("5.0", "6.0", "sure")).await.unwrap();
    assert_eq!(outcome, Outcome::Dropped(DropReason::Rejected));
    assert_eq!(bridge.registry().ownership(&key("5.0")), Ownership::Rejected);
    assert!(bridge.registry().snapshot(&key("5.0")).await.is_none());

    let outcome = bridge.handle_message(reply("5.0", "7.0", "ok")).await.unwrap();
    assert_eq!(outcome, Outcome::Dropped(DropReason::Rejected));
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 1);
    assert!(sink.sent().is_empty());
    assert!(launcher.requests().is_empty());
}

#[tokio::test]
async fn thread_with_bot_history_is_joined_with_context() {
    let sink = Arc::new(FakeSink::default());
    sink.seed_thread(
        "5.0",
        &[
            ("5.0", "U1", "<@UBOT> which hosts are offline?"),
            ("5.5", "UBOT", "three of them"),
            ("7.0", "U1", "which ones?"),
        ],
    );
    let launcher = ScriptedLauncher::with(vec![
        Script::Lines(vec![system("s9"), text("a, b and c")], 0),
        Script::Lines(vec![text("yes")], 0),
    ]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(reply("5.0", "7.0", "which ones?")).await.unwrap();

    let prompt = &launcher.requests()[0].prompt;
    assert!(prompt.starts_with("You are continuing a conversation with the user."));
    assert!(prompt.contains("three of them"));
    assert!(prompt.ends_with("The user just said:\nwhich ones?"));
    assert_eq!(prompt.matches("which ones?").count(), 1);
    assert!(matches!(sink.sent()[0], Sent::Post { ref text, .. } if text == "still thinking"));

    bridge.handle_message(reply("5.0", "8.0", "all fixed now?")).await.unwrap();
    let requests = launcher.requests();
    assert_eq!(requests[1].prompt, "all fixed now?");
    assert_eq!(requests[1].resume.as_deref(), Some("s9"));
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mention_in_rejected_thread_promotes_it() {
    let sink = Arc::new(FakeSink::default());
    sink.seed_thread("5.0", &[("5.0", "U1", "lunch?"), ("6.0", "U2", "sure")]);
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![text("on it")], 0)]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(reply("5.0", "6.0", "sure")).await.unwrap();
    let outcome = bridge.handle_message(reply("5.0", "8.0", "<@UBOT> book a table")).await.unwrap();

    assert!(matches!(outcome, Outcome::Answered(_)));
    assert_eq!(bridge.registry().ownership(&key("5.0")), Ownership::Owned);
    assert_eq!(launcher.requests()[0].prompt, "book a table");
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unaddressed_own_and_empty_messages_dropped_without_state() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(Vec::new());
    let bridge = bridge(&sink, &launcher);

    let own = InboundMessage {
        user: Some("UBOT".to_string()),
        ..root("1.0", "<@UBOT> talking to myself")
    };
    assert_eq!(
        bridge.handle_message(root("1.0", "good morning")).await.unwrap(),
        Outcome::Dropped(DropReason::NotAddressed)
    );
    assert_eq!(
        bridge.handle_message(own).await.unwrap(),
        Outcome::Dropped(DropReason::OwnMessage)
    );
    assert_eq!(
        bridge.handle_message(root("2.0", "<@UBOT>   ")).await.unwrap(),
        Outcome::Dropped(DropReason::Empty)
    );
    assert_eq!(bridge.registry().stats(), RegistryStats::default());
    assert!(sink.sent().is_empty());
    assert!(launcher.requests().is_empty());
}

#[tokio::test]
async fn malformed_output_line_is_skipped() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Lines(
        vec!["{not json".to_string(), String::new(), text("still here")],
        0,
    )]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap();
    assert_eq!(last_update(&sink), "still here");
}

#[tokio::test]
async fn failed_agent_without_text_resolves_placeholder() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![system("s1")], 2)]);
    let bridge = bridge(&sink, &launcher);

    let outcome = bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap();
    let Outcome::Answered(report) = outcome else {
        panic!("expected a turn");
    };
    assert_eq!(report.replies, 0);
    assert_eq!(report.exit.code, Some(2));
    assert!(last_update(&sink).contains("code 2"));
    // The session id is kept even though the turn failed.
    let state = bridge.registry().snapshot(&key("1.0")).await.unwrap();
    assert_eq!(state.continuation_token.as_deref(), Some("s1"));
    assert_eq!(state.pending_placeholder, None);
}

#[tokio::test]
async fn launch_failure_is_reported_in_thread() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::FailLaunch]);
    let bridge = bridge(&sink, &launcher);

    let err = bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap_err();
    assert!(matches!(err, BridgeError::Launch(_)));
    assert!(last_update(&sink).contains("could not be started"));
    let state = bridge.registry().snapshot(&key("1.0")).await.unwrap();
    assert_eq!(state.pending_placeholder, None);
}

#[tokio::test]
async fn failed_placeholder_edit_falls_back_to_post() {
    let sink = Arc::new(FakeSink::default());
    sink.fail_updates.store(true, Ordering::SeqCst);
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![text("4")], 0)]);
    let bridge = bridge(&sink, &launcher);

    bridge.handle_message(root("1.0", "<@UBOT> 2+2")).await.unwrap();
    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[1], Sent::Post { ref text, .. } if text == "4"));
}

#[tokio::test]
async fn same_thread_turns_run_one_at_a_time() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Manual, Script::Lines(vec![text("second answer")], 0)]);
    let bridge = Arc::new(bridge(&sink, &launcher));

    let first = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_message(root("1.0", "<@UBOT> first")).await })
    };
    wait_for_launches(&launcher, 1).await;
    let second = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_message(reply("1.0", "2.0", "second")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.requests().len(), 1);
    assert_eq!(bridge.in_flight_count(), 2);

    let feed = launcher.feeds.lock().unwrap().pop().unwrap();
    feed.send(system("s1")).await.unwrap();
    feed.send(text("first answer")).await.unwrap();
    drop(feed);

    assert!(matches!(first.await.unwrap().unwrap(), Outcome::Answered(_)));
    assert!(matches!(second.await.unwrap().unwrap(), Outcome::Answered(_)));
    let requests = launcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].resume.as_deref(), Some("s1"));
    assert_eq!(bridge.in_flight_count(), 0);
}

#[tokio::test]
async fn deleting_the_message_cancels_its_turn() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Manual]);
    let bridge = Arc::new(bridge(&sink, &launcher));

    let turn = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_message(root("1.0", "<@UBOT> long job")).await })
    };
    wait_for_launches(&launcher, 1).await;
    assert!(bridge.retract("C1", "1.0"));

    let Outcome::Answered(report) = turn.await.unwrap().unwrap() else {
        panic!("expected a turn");
    };
    assert_eq!(report.interrupted, Some(Interruption::Withdrawn));
    assert!(report.exit.killed);
    assert!(last_update(&sink).contains("withdrawn"));
    assert_eq!(bridge.in_flight_count(), 0);
    assert!(!bridge.retract("C1", "1.0"));
}

#[tokio::test]
async fn slow_agent_times_out() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Manual]);
    let bridge = bridge(&sink, &launcher).with_turn_timeout(Duration::from_millis(100));

    let Outcome::Answered(report) = bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap() else {
        panic!("expected a turn");
    };
    assert_eq!(report.interrupted, Some(Interruption::TimedOut));
    assert!(last_update(&sink).contains("too long"));
}

#[tokio::test]
async fn no_turns_start_after_shutdown() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(Vec::new());
    let bridge = bridge(&sink, &launcher);

    bridge.cancel_all();
    let outcome = bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap();
    assert_eq!(outcome, Outcome::Withdrawn);
    assert!(sink.sent().is_empty());
    assert!(launcher.requests().is_empty());
}

#[tokio::test]
async fn unavailable_transcript_abandons_the_event() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(Vec::new());
    let bridge = bridge(&sink, &launcher);

    let err = bridge.handle_message(reply("5.0", "6.0", "<@UBOT> anyone?")).await.unwrap_err();
    assert!(matches!(err, BridgeError::Transcript(_)));
    assert_eq!(bridge.registry().ownership(&key("5.0")), Ownership::Unknown);
    assert!(sink.sent().is_empty());
    assert!(launcher.requests().is_empty());

    // The next message retries the scan.
    sink.seed_thread("5.0", &[("5.0", "U1", "<@UBOT> anyone?")]);
    bridge.handle_message(reply("5.0", "7.0", "hello?")).await.unwrap();
    assert_eq!(sink.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.registry().ownership(&key("5.0")), Ownership::Owned);
}

#[tokio::test]
async fn undeliverable_reply_leaves_placeholder_for_the_notice() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Manual]);
    let bridge = Arc::new(bridge(&sink, &launcher));

    let turn = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_message(root("1.0", "<@UBOT> hi")).await })
    };
    wait_for_launches(&launcher, 1).await;
    // Both the edit and the fallback post of the reply fail.
    sink.outage.store(2, Ordering::SeqCst);
    let feed = launcher.feeds.lock().unwrap().pop().unwrap();
    feed.send(text("4")).await.unwrap();
    drop(feed);

    let Outcome::Answered(report) = turn.await.unwrap().unwrap() else {
        panic!("expected a turn");
    };
    assert_eq!(report.replies, 0);
    assert_eq!(
        sink.sent().last(),
        Some(&Sent::Update {
            ts: "9.1".to_string(),
            text: "I finished without anything to say. try rephrasing?".to_string()
        })
    );
    let state = bridge.registry().snapshot(&key("1.0")).await.unwrap();
    assert_eq!(state.pending_placeholder, None);
}

#[tokio::test]
async fn placeholder_stays_pending_when_the_thread_is_unreachable() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Manual]);
    let bridge = Arc::new(bridge(&sink, &launcher));

    let turn = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_message(root("1.0", "<@UBOT> hi")).await })
    };
    wait_for_launches(&launcher, 1).await;
    sink.outage.store(usize::MAX, Ordering::SeqCst);
    let feed = launcher.feeds.lock().unwrap().pop().unwrap();
    feed.send(text("4")).await.unwrap();
    drop(feed);

    turn.await.unwrap().unwrap();
    assert_eq!(sink.sent().len(), 1);
    let state = bridge.registry().snapshot(&key("1.0")).await.unwrap();
    assert_eq!(state.pending_placeholder.as_deref(), Some("9.1"));
}

#[tokio::test]
async fn empty_text_block_is_not_posted() {
    let sink = Arc::new(FakeSink::default());
    let launcher = ScriptedLauncher::with(vec![Script::Lines(vec![text(""), text("4")], 0)]);
    let bridge = bridge(&sink, &launcher);

    let outcome = bridge.handle_message(root("1.0", "<@UBOT> hi")).await.unwrap();
    assert!(matches!(outcome, Outcome::Answered(ref r) if r.replies == 1));
    assert_eq!(sink.sent().len(), 2);
    assert_eq!(last_update(&sink), "4");
}
