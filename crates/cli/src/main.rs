use async_trait::async_trait;
use clap::{Parser, Subcommand};
use lib::agent::{self, AgentCommand, AgentRequest, Launcher};
use lib::channels::{MessageSink, SinkError, ThreadMessage};
use lib::routing::ConversationKey;
use lib::session::ThreadRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "threadbot")]
#[command(about = "Slack thread bridge for a command-line reasoning agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory with a default config.json and system prompt.
    Init {
        /// Config file path (default: THREADBOT_CONFIG_PATH or ~/.threadbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge: Slack Socket Mode in, agent replies out, health endpoint on the gateway port.
    Gateway {
        /// Config file path (default: THREADBOT_CONFIG_PATH or ~/.threadbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Health endpoint port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Talk to the agent from the terminal, one turn per line, keeping the session between lines.
    Chat {
        /// Config file path (default: THREADBOT_CONFIG_PATH or ~/.threadbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Continuation token of an earlier agent session to resume.
        #[arg(long, value_name = "TOKEN")]
        resume: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: reading .env failed: {}", e);
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("threadbot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, resume }) => {
            if let Err(e) = run_chat(config, resume).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<std::path::PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway (config {})", path.display());
    lib::gateway::run_gateway(config, path).await
}

/// Prints thread messages to the terminal instead of posting them.
struct TerminalSink {
    next_ts: AtomicU64,
}

#[async_trait]
impl MessageSink for TerminalSink {
    async fn post_message(&self, _channel: &str, _thread_ts: &str, text: &str) -> Result<String, SinkError> {
        println!("< {}", text.trim());
        Ok(self.next_ts.fetch_add(1, Ordering::Relaxed).to_string())
    }

    async fn update_message(&self, _channel: &str, _ts: &str, text: &str) -> Result<(), SinkError> {
        println!("< {}", text.trim());
        Ok(())
    }

    async fn thread_messages(&self, _channel: &str, _root_ts: &str) -> Result<Vec<ThreadMessage>, SinkError> {
        Ok(Vec::new())
    }
}

async fn run_chat(config_path: Option<std::path::PathBuf>, resume: Option<String>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let prompt_path = lib::config::resolve_system_prompt_path(&config, &path);
    let launcher = AgentCommand::from_config(&config.agent, lib::prompt::load_system_prompt(&prompt_path));
    let timeout = config.agent.turn_timeout();
    let sink = TerminalSink {
        next_ts: AtomicU64::new(1),
    };

    let registry = ThreadRegistry::default();
    let mut thread = registry.lock(&ConversationKey::new("terminal", "0")).await;
    thread.mark_owned(true);
    if let Some(token) = resume {
        thread.record_token(token);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        let request = AgentRequest {
            prompt: input.to_string(),
            resume: thread.continuation_token().map(String::from),
        };
        let process = match launcher.launch(&request) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("chat error: {}", e);
                continue;
            }
        };
        let cancel = CancellationToken::new();
        let turn = agent::run_turn(process, &mut thread, &sink, None, timeout, &cancel);
        tokio::pin!(turn);
        let report = tokio::select! {
            report = &mut turn => report,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };
        if report.replies == 0 {
            match (report.interrupted, report.exit.code) {
                (Some(reason), _) => eprintln!("(no reply: {:?})", reason),
                (None, Some(code)) => eprintln!("(no reply; agent exited with code {})", code),
                (None, None) => eprintln!("(no reply; agent terminated)"),
            }
        }
    }

    if let Some(token) = thread.continuation_token() {
        println!("session: {} (resume with --resume {})", token, token);
    }
    Ok(())
}
