// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory cluster contract for tests and local development.

use super::{ClusterContract, SessionInfoStream};
use crate::error::SessionError;
use crate::session::{SessionInfo, SharedSession};
use crate::Result;
use async_trait::async_trait;
use futures::stream;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
struct MockClusterState {
    remote_alive: HashSet<String>,
    remote_infos: Vec<SessionInfo>,
    removed: Vec<String>,
    fail_remote: bool,
}

/// Scriptable [`ClusterContract`]: tests decide which devices are "alive
/// elsewhere", what the remote enumeration returns, and whether remote calls
/// fail. Records every remote eviction it is asked to perform.
#[derive(Clone)]
pub struct MockCluster {
    server_id: String,
    state: Arc<RwLock<MockClusterState>>,
}

impl MockCluster {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            state: Arc::new(RwLock::new(MockClusterState::default())),
        }
    }

    /// Mark a device as online (or not) on some other node.
    pub fn set_remote_alive(&self, device_id: &str, alive: bool) {
        let mut state = self.state.write();
        if alive {
            state.remote_alive.insert(device_id.to_string());
        } else {
            state.remote_alive.remove(device_id);
        }
    }

    /// Add a session to the remote enumeration.
    pub fn push_remote_info(&self, info: SessionInfo) {
        self.state.write().remote_infos.push(info);
    }

    /// Make every remote call fail until reset.
    pub fn fail_remote_calls(&self, fail: bool) {
        self.state.write().fail_remote = fail;
    }

    /// Device ids this cluster was asked to evict remotely.
    pub fn removed(&self) -> Vec<String> {
        self.state.read().removed.clone()
    }

    fn check_available(&self, what: &str) -> Result<()> {
        if self.state.read().fail_remote {
            return Err(SessionError::remote_unavailable(
                what,
                &anyhow::anyhow!("mock cluster unavailable"),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterContract for MockCluster {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn remote_session_is_alive(&self, device_id: &str) -> Result<bool> {
        self.check_available(device_id)?;
        Ok(self.state.read().remote_alive.contains(device_id))
    }

    async fn check_remote_session_is_alive(&self, device_id: &str) -> Result<bool> {
        self.check_available(device_id)?;
        Ok(self.state.read().remote_alive.contains(device_id))
    }

    async fn remove_remote_session(&self, device_id: &str) -> Result<u64> {
        self.check_available(device_id)?;
        let mut state = self.state.write();
        state.removed.push(device_id.to_string());
        Ok(u64::from(state.remote_alive.remove(device_id)))
    }

    async fn remote_total_sessions(&self) -> Result<u64> {
        self.check_available("*")?;
        Ok(self.state.read().remote_infos.len() as u64)
    }

    async fn remote_sessions(&self, server_id: Option<&str>) -> Result<SessionInfoStream> {
        self.check_available(server_id.unwrap_or("*"))?;
        let infos: Vec<_> = self
            .state
            .read()
            .remote_infos
            .iter()
            .filter(|info| server_id.map_or(true, |id| info.server_id == id))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(infos)))
    }

    async fn init_session_connection(&self, session: &SharedSession) -> Result<bool> {
        self.check_available(session.device_id())?;
        Ok(self.state.read().remote_alive.contains(session.device_id()))
    }
}
