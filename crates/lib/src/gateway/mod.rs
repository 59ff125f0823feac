//! Gateway: runs the bridge against Slack.
//!
//! Socket Mode delivers events, the bridge answers them through the Web API, and a single
//! HTTP port serves a health endpoint.

mod server;

pub use server::{health_router, run_gateway, serve_health, spawn_processor, GatewayState};
