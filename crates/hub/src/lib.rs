// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ridehub: real-time connection hub for ride-hailing clients.

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod manager;
pub mod message;
pub mod state;
pub mod store;
pub mod test_support;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::bus::nats::NatsBus;
use crate::bus::{Bus, LocalBus};
use crate::config::HubConfig;
use crate::manager::{Manager, Stores};
use crate::state::AppState;
use crate::store::memory::StoreLimits;
use crate::transport::auth::HmacAuthenticator;
use crate::transport::build_router;

/// Initialize the tracing subscriber from config.
pub fn init_tracing(config: &HubConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Run the hub server until ctrl-c.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    config.validate()?;
    let addr = config.addr();
    let limits = StoreLimits::from_config(&config);

    let (bus, stores): (Arc<dyn Bus>, Stores) = match config.nats_url {
        Some(ref url) => {
            let client = bus::nats::connect(url, config.nats_token.as_deref()).await?;
            let stores = Stores::kv(client.clone(), &config.kv_prefix, limits).await?;
            (Arc::new(NatsBus::new(client, config.bus_channel.clone())), stores)
        }
        None => {
            info!("no NATS url configured, running single-node");
            (Arc::new(LocalBus::default()), Stores::memory(limits))
        }
    };

    let secret = config.auth_secret.clone().unwrap_or_default();
    let manager = Manager::new(config.clone(), bus, stores);
    manager.start();

    let state = Arc::new(AppState::new(
        Arc::clone(&manager),
        Arc::new(HmacAuthenticator::new(secret.as_bytes())),
    ));
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("ridehub listening on {addr}");

    let shutdown = manager.shutdown_token().clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let served =
        axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await;
    manager.shutdown(config.shutdown_timeout()).await;
    served?;
    Ok(())
}
