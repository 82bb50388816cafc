// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Output is `READABLE` by default; set `SESSION_PLANE_LOG_JSONL=1` for one
//! JSON object per line. Filters are configured through the
//! `SESSION_PLANE_LOG` environment variable using the usual `EnvFilter`
//! syntax (e.g. `info,session_plane=debug`); the default level is `info`.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "SESSION_PLANE_LOG";
const JSONL_ENV: &str = "SESSION_PLANE_LOG_JSONL";

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        if jsonl {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
