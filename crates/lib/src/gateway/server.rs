//! Gateway runtime: Socket Mode events in, agent turns out, plus an HTTP health endpoint.

use crate::agent::AgentCommand;
use crate::bridge::Bridge;
use crate::channels::{InboundEvent, SlackClient, SocketModeConnector};
use crate::config::{self, Config};
use crate::prompt;
use crate::routing::BotIdentity;
use crate::session::{Placeholders, ThreadRegistry};
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const INBOUND_BUFFER: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the health endpoint.
#[derive(Clone)]
pub struct GatewayState {
    pub bridge: Arc<Bridge>,
    pub port: u16,
}

/// Router serving `GET /` health JSON.
pub fn health_router(state: GatewayState) -> Router {
    Router::new().route("/", get(health_http)).with_state(state)
}

/// Serve the health endpoint on an already-bound listener until `shutdown` completes.
pub async fn serve_health<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("health server exited")
}

/// Hand inbound events to the bridge: one task per message, retractions handled inline so
/// they are never stuck behind a busy thread. Ends when the inbound channel closes.
pub fn spawn_processor(bridge: Arc<Bridge>, mut inbound_rx: mpsc::Receiver<InboundEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            match event {
                InboundEvent::Retracted { channel, ts } => {
                    bridge.retract(&channel, &ts);
                }
                message => {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        bridge.handle_event(message).await;
                    });
                }
            }
        }
        log::debug!("inbound processor stopped");
    })
}

/// Run the bridge: authenticate with Slack, open Socket Mode, process events until Ctrl+C / SIGTERM.
/// `config_path` is used to resolve the system prompt file.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bot_token = config::resolve_bot_token(&config)
        .context("slack bot token not set (slack.botToken or SLACK_BOT_TOKEN)")?;
    let app_token = config::resolve_app_token(&config)
        .context("slack app token not set (slack.appToken or SLACK_APP_TOKEN)")?;
    let slack = Arc::new(
        SlackClient::new(bot_token, Some(app_token))
            .with_api_base(config.slack.api_base.clone())
            .with_page_limit(config.slack.transcript_page_limit),
    );
    let bot_user = slack.auth_test().await.context("slack auth.test failed")?;

    let prompt_path = config::resolve_system_prompt_path(&config, &config_path);
    let system_prompt = prompt::load_system_prompt(&prompt_path);
    let launcher = Arc::new(AgentCommand::from_config(&config.agent, system_prompt));
    log::info!(
        "agent command: {} (mcp config {})",
        config.agent.command,
        config.agent.mcp_config.display()
    );

    let registry = Arc::new(ThreadRegistry::from_config(&config.threads));
    let bridge = Arc::new(
        Bridge::new(BotIdentity::new(bot_user), registry, slack.clone(), launcher)
            .with_placeholders(Placeholders::from_config(&config.threads))
            .with_turn_timeout(config.agent.turn_timeout()),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(INBOUND_BUFFER);
    let connector = Arc::new(SocketModeConnector::new(slack));
    let connector_task = connector.clone().start_inbound(inbound_tx);
    let processor_task = spawn_processor(bridge.clone(), inbound_rx);
    let shutdown = shutdown_signal(connector, bridge.clone(), vec![connector_task, processor_task]);

    if config.gateway.health {
        let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        log::info!("health endpoint listening on {}", bind_addr);
        let state = GatewayState {
            bridge,
            port: config.gateway.port,
        };
        serve_health(listener, state, shutdown).await?;
    } else {
        shutdown.await;
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM after stopping the connector, cancelling in-flight turns,
/// and awaiting the background tasks.
async fn shutdown_signal(connector: Arc<SocketModeConnector>, bridge: Arc<Bridge>, tasks: Vec<JoinHandle<()>>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping connector and cancelling turns");

    connector.stop();
    bridge.cancel_all();
    for task in tasks {
        let _ = task.await;
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while bridge.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    match drained {
        Ok(()) => log::info!("all turns finished"),
        Err(_) => log::warn!(
            "{} turn(s) still running after {:?}, exiting anyway",
            bridge.in_flight_count(),
            DRAIN_TIMEOUT
        ),
    }
}

/// GET / returns registry counts and in-flight turns (for liveness checks).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let stats = state.bridge.registry().stats();
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "threads": {
            "owned": stats.owned,
            "rejected": stats.rejected,
            "unknown": stats.unknown,
        },
        "inFlight": state.bridge.in_flight_count(),
    }))
}
