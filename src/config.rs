// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session manager configuration.
//!
//! Configuration is loaded in layers, later layers overriding earlier ones:
//!   1. Built-in defaults.
//!   2. Optional TOML file pointed to by the `SESSION_PLANE_CONFIG` environment variable.
//!   3. Environment variables prefixed with `SESSION_PLANE_` (e.g.
//!      `SESSION_PLANE_SERVER_ID`, `SESSION_PLANE_SESSION_LOAD_TIMEOUT_MS`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "SESSION_PLANE_CONFIG";
const ENV_PREFIX: &str = "SESSION_PLANE_";

/// Settings for a [`crate::manager::DeviceSessionManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Stable identity of this node within the cluster. Defaults to a random
    /// id, which is only appropriate for nodes that do not restart-and-resume.
    pub server_id: String,
    /// Upper bound on a single session load, in milliseconds.
    pub session_load_timeout_ms: u64,
    /// Period of the liveness sweep, in milliseconds.
    pub session_check_interval_ms: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            session_load_timeout_ms: 5_000,
            session_check_interval_ms: 30_000,
        }
    }
}

impl SessionManagerConfig {
    /// Load configuration from the layered settings sources.
    pub fn from_settings() -> crate::Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX));
        Ok(figment.extract()?)
    }

    pub fn session_load_timeout(&self) -> Duration {
        Duration::from_millis(self.session_load_timeout_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }
}
