// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::config::HubConfig;
use crate::manager::Manager;
use crate::transport::auth::Authenticator;

/// Shared state handed to every axum handler.
pub struct AppState {
    pub manager: Arc<Manager>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self { manager, authenticator }
    }

    pub fn config(&self) -> &HubConfig {
        self.manager.config()
    }
}
