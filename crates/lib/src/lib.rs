//! Threadbot core library: Slack thread routing, agent invocation and the gateway runtime
//! used by the CLI.

pub mod agent;
pub mod bridge;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod prompt;
pub mod routing;
pub mod session;
pub mod transcript;
