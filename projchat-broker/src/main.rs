//! `ProjChat` broker -- in-memory channel broker for local development.
//!
//! An axum server that authenticates WebSocket connections by token, fans
//! channel messages out to subscribers and serves the history, roster and
//! delete routes under `/api`.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000 with accounts from the config file
//! cargo run --bin projchat-broker
//!
//! # Run on custom address
//! cargo run --bin projchat-broker -- --bind 127.0.0.1:8080 --config broker.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use projchat_broker::broker::{self, BrokerState};
use projchat_broker::config::{BrokerCliArgs, BrokerConfig};

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.accounts.is_empty() {
        tracing::warn!("no [[users]] configured; every connection will be rejected");
    }
    tracing::info!(addr = %config.bind_addr, accounts = config.accounts.len(), "starting projchat broker");

    let state = Arc::new(BrokerState::from_config(&config));

    match broker::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
