// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use ridehub::config::HubConfig;

#[tokio::main]
async fn main() {
    let config = HubConfig::parse();
    ridehub::init_tracing(&config);

    if let Err(e) = ridehub::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
