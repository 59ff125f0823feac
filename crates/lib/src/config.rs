//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.threadbot/config.json`) and environment.
//! Slack tokens in the environment override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Slack workspace credentials and API settings.
    #[serde(default)]
    pub slack: SlackConfig,

    /// How the reasoning agent is launched.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Thread registry limits and placeholder texts.
    #[serde(default)]
    pub threads: ThreadsConfig,

    /// Health endpoint settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Slack credentials. Both tokens are overridden by SLACK_BOT_TOKEN / SLACK_APP_TOKEN.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    /// Bot token (xoxb-...) used for the Web API.
    pub bot_token: Option<String>,
    /// App-level token (xapp-...) used to open Socket Mode connections.
    pub app_token: Option<String>,
    /// Web API base URL (default "https://slack.com/api").
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    /// Maximum number of conversations.replies pages fetched when scanning a thread.
    #[serde(default = "default_transcript_page_limit")]
    pub transcript_page_limit: usize,
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_transcript_page_limit() -> usize {
    10
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            app_token: None,
            api_base: default_slack_api_base(),
            transcript_page_limit: default_transcript_page_limit(),
        }
    }
}

/// Agent process settings. The command is invoked with the baseline options plus `-p` and optionally `-r`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Executable name or path (default "claude").
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Path passed to --mcp-config.
    #[serde(default = "default_mcp_config")]
    pub mcp_config: PathBuf,
    /// File holding the system prompt. Relative paths are resolved against the config file's parent.
    #[serde(default = "default_system_prompt_file")]
    pub system_prompt_file: PathBuf,
    /// Pass --verbose (required by the CLI for stream-json output).
    #[serde(default = "default_true")]
    pub verbose: bool,
    /// Extra arguments appended after the baseline options.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Working directory for the agent process. Defaults to the gateway's working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Upper bound on one turn, in seconds. The process is killed when it elapses.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_mcp_config() -> PathBuf {
    PathBuf::from("./mcp-servers.json")
}

fn default_system_prompt_file() -> PathBuf {
    PathBuf::from("system-prompt.txt")
}

fn default_true() -> bool {
    true
}

fn default_turn_timeout_secs() -> u64 {
    600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            mcp_config: default_mcp_config(),
            system_prompt_file: default_system_prompt_file(),
            verbose: true,
            extra_args: Vec::new(),
            working_dir: None,
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs.max(1))
    }
}

/// Registry bounds and the texts shown while the agent is working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsConfig {
    /// Owned threads kept in memory; least recently used are evicted beyond this.
    #[serde(default = "default_max_owned")]
    pub max_owned: usize,
    /// Rejected (or unclassified) threads remembered; oldest are evicted beyond this.
    #[serde(default = "default_max_unowned")]
    pub max_unowned: usize,
    /// First-turn placeholder candidates; one is picked at random.
    #[serde(default = "default_placeholders")]
    pub placeholders: Vec<String>,
    /// Placeholder for every later turn in a thread.
    #[serde(default = "default_follow_up_placeholder")]
    pub follow_up_placeholder: String,
}

fn default_max_owned() -> usize {
    10_000
}

fn default_max_unowned() -> usize {
    1024
}

fn default_placeholders() -> Vec<String> {
    [
        "Hold your 🐴🐴, I'm thinking about it...",
        "Just a moment, I'm working on it...",
        "Give me a second, I'm on it...",
        "Hang tight, I'm processing your request...",
        "Let me think about that for a moment...",
        "Processing your request, please hold on...",
        "Consulting the office :cat: for advice…",
        "Telling my :turtle: CPU to hurry up...",
        "Pausing to pet the :dog2:... almost there!",
        "Looking for the missing :bone: of knowledge...",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_follow_up_placeholder() -> String {
    "🤔 Thinking...".to_string()
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            max_owned: default_max_owned(),
            max_unowned: default_max_unowned(),
            placeholders: default_placeholders(),
            follow_up_placeholder: default_follow_up_placeholder(),
        }
    }
}

/// Health endpoint bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the health endpoint (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Serve GET / health JSON. When false, no listener is opened.
    #[serde(default = "default_true")]
    pub health: bool,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            health: true,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// A non-blank value of `var` from `env` wins over a non-blank configured value.
fn token_from(env: impl Fn(&str) -> Option<String>, var: &str, configured: Option<&String>) -> Option<String> {
    non_empty(env(var).as_ref()).or_else(|| non_empty(configured))
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Resolve the Slack bot token: env SLACK_BOT_TOKEN overrides config.
pub fn resolve_bot_token(config: &Config) -> Option<String> {
    token_from(process_env, "SLACK_BOT_TOKEN", config.slack.bot_token.as_ref())
}

/// Resolve the Slack app-level token: env SLACK_APP_TOKEN overrides config.
pub fn resolve_app_token(config: &Config) -> Option<String> {
    token_from(process_env, "SLACK_APP_TOKEN", config.slack.app_token.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("THREADBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".threadbot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Directory holding the config file; relative paths in the config resolve against it.
pub fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the system prompt file: absolute paths as-is, relative ones against the config directory.
pub fn resolve_system_prompt_path(config: &Config, config_path: &Path) -> PathBuf {
    let file = &config.agent.system_prompt_file;
    if file.is_absolute() {
        file.clone()
    } else {
        config_dir(config_path).join(file)
    }
}

/// Load config from the given path (or THREADBOT_CONFIG_PATH / default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
