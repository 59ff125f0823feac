//! Agent process launcher: run the agent CLI for one turn and stream its stdout line by line.
//! No shell is used; arguments are passed as a list.

use crate::config::AgentConfig;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LINE_BUFFER: usize = 64;
const MAX_STDERR_LINES: usize = 500;
/// How long stderr may stay open after the process exits (a grandchild can inherit it).
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// What to send the agent for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub prompt: String,
    /// Continuation token from an earlier turn (`-r`).
    pub resume: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// How an agent process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentExit {
    /// Exit code; None when terminated by a signal or when waiting failed.
    pub code: Option<i32>,
    /// Diagnostic output (last lines kept).
    pub stderr: Vec<String>,
    /// The process was killed by us (cancelled, timed out, or its output abandoned).
    pub killed: bool,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.killed
    }
}

/// A running (or scripted) agent turn: a finite, non-restartable sequence of stdout lines.
pub struct AgentProcess {
    lines: mpsc::Receiver<String>,
    done: JoinHandle<AgentExit>,
    cancel: CancellationToken,
    /// Fired by `wait` once the consumer is done reading.
    released: CancellationToken,
}

impl AgentProcess {
    /// Next stdout line; None once the process has closed its output.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Kill the process. Lines already buffered may still be read.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that kills the process, usable while `wait` is pending.
    pub fn kill_switch(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the process to exit. Unread output is discarded and the process killed if still writing.
    pub async fn wait(self) -> AgentExit {
        drop(self.lines);
        self.released.cancel();
        match self.done.await {
            Ok(exit) => exit,
            Err(e) => AgentExit {
                code: None,
                stderr: vec![format!("agent supervisor failed: {}", e)],
                killed: true,
            },
        }
    }

    /// A process whose output is fed through the returned sender; dropping the sender closes it.
    /// `exit` is reported unless the process is cancelled first. Must be called inside a tokio runtime.
    pub fn channel(exit: AgentExit) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let cancel = CancellationToken::new();
        let released = CancellationToken::new();
        let (killed, done_reading) = (cancel.clone(), released.clone());
        let done = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = killed.cancelled() => AgentExit { code: None, killed: true, ..exit },
                _ = done_reading.cancelled() => exit,
            }
        });
        let process = Self {
            lines: rx,
            done,
            cancel,
            released,
        };
        (tx, process)
    }

    /// A process replaying fixed output, for tests and dry runs. Must be called inside a tokio runtime.
    pub fn scripted(lines: Vec<String>, exit: AgentExit) -> Self {
        let (tx, process) = Self::channel(exit);
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        process
    }
}

/// Starts one agent process per turn.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &AgentRequest) -> Result<AgentProcess, AgentError>;
}

/// The agent CLI with its fixed baseline options.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub mcp_config: PathBuf,
    pub system_prompt: String,
    pub verbose: bool,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl AgentCommand {
    pub fn from_config(config: &AgentConfig, system_prompt: String) -> Self {
        Self {
            program: config.command.clone(),
            mcp_config: config.mcp_config.clone(),
            system_prompt,
            verbose: config.verbose,
            extra_args: config.extra_args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    /// Full argument list: baseline options, extra args, `-p <prompt>`, then `-r <token>` when resuming.
    pub fn args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "--mcp-config".to_string(),
            self.mcp_config.display().to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--system-prompt".to_string(),
            self.system_prompt.clone(),
        ];
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("-p".to_string());
        args.push(request.prompt.clone());
        if let Some(ref token) = request.resume {
            args.push("-r".to_string());
            args.push(token.clone());
        }
        args
    }
}

impl Launcher for AgentCommand {
    fn launch(&self, request: &AgentRequest) -> Result<AgentProcess, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| AgentError::Launch {
            program: self.program.clone(),
            source,
        })?;
        log::debug!("agent: started {} (pid {:?})", self.program, child.id());
        let stdout = child.stdout.take().ok_or(AgentError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(AgentError::MissingPipe("stderr"))?;
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let cancel = CancellationToken::new();
        let done = tokio::spawn(supervise(child, stdout, stderr, tx, cancel.clone()));
        Ok(AgentProcess {
            lines: rx,
            done,
            cancel,
            released: CancellationToken::new(),
        })
    }
}

/// Read one line (lossy UTF-8, trailing newline removed). None at end of stream.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(&['\n', '\r'][..]).to_string()))
}

async fn drain_stderr(stderr: ChildStderr, stop: CancellationToken) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut lines = VecDeque::new();
    let mut dropped = 0usize;
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = read_line(&mut reader, &mut buf) => next,
        };
        let Ok(Some(line)) = next else {
            break;
        };
        if lines.len() == MAX_STDERR_LINES {
            lines.pop_front();
            dropped += 1;
        }
        lines.push_back(line);
    }
    if dropped > 0 {
        lines.push_front(format!("({} earlier stderr lines dropped)", dropped));
    }
    lines.into()
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> AgentExit {
    let stop_stderr = CancellationToken::new();
    let mut stderr_task = tokio::spawn(drain_stderr(stderr, stop_stderr.clone()));
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut kill = false;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                kill = true;
                break;
            }
            next = read_line(&mut reader, &mut buf) => next,
        };
        match next {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    kill = true;
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("agent: reading stdout failed: {}", e);
                kill = true;
                break;
            }
        }
    }
    drop(tx);
    // Stdout is closed; the process may keep running until it is cancelled.
    if !kill {
        tokio::select! {
            _ = child.wait() => {}
            _ = cancel.cancelled() => kill = true,
        }
    }
    if kill {
        if let Err(e) = child.kill().await {
            log::debug!("agent: kill failed: {}", e);
        }
    }
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("agent: waiting for process failed: {}", e);
            None
        }
    };
    let stderr = tokio::select! {
        biased;
        lines = &mut stderr_task => lines.unwrap_or_default(),
        _ = tokio::time::sleep(STDERR_GRACE) => {
            log::debug!("agent: stderr still open after exit, no longer reading it");
            stop_stderr.cancel();
            stderr_task.await.unwrap_or_default()
        }
    };
    AgentExit {
        code,
        stderr,
        killed: kill,
    }
}
