// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The contract the session core requires from the cluster transport.
//!
//! The gossip/membership implementation itself is an external collaborator;
//! the core only consumes the operations below. Remote queries come in two
//! strengths: `remote_session_is_alive` is a cheap cache/gossip-backed
//! answer, `check_remote_session_is_alive` is authoritative and may probe
//! peers.

use crate::session::{SessionInfo, SharedSession};
use crate::Result;
use async_trait::async_trait;
use futures::{stream, Stream};
use std::pin::Pin;

mod mock;
pub use mock::MockCluster;

/// Stream type for remote session enumeration.
pub type SessionInfoStream = Pin<Box<dyn Stream<Item = Result<SessionInfo>> + Send>>;

/// Cluster operations the session manager depends on.
#[async_trait]
pub trait ClusterContract: Send + Sync {
    /// Stable identifier of this node.
    fn server_id(&self) -> &str;

    /// Cheap query: is the device known to be online on another node?
    async fn remote_session_is_alive(&self, device_id: &str) -> Result<bool>;

    /// Authoritative query: probe peers for the device's session.
    async fn check_remote_session_is_alive(&self, device_id: &str) -> Result<bool>;

    /// Evict the device's sessions on all other nodes; returns how many were
    /// removed.
    async fn remove_remote_session(&self, device_id: &str) -> Result<u64>;

    /// Number of sessions held by all other nodes.
    async fn remote_total_sessions(&self) -> Result<u64>;

    /// Enumerate sessions on other nodes, optionally restricted to one node.
    async fn remote_sessions(&self, server_id: Option<&str>) -> Result<SessionInfoStream>;

    /// Whether the device still has a connection on another node. Consulted
    /// during local close to decide how unregister is reported.
    async fn init_session_connection(&self, session: &SharedSession) -> Result<bool>;
}

/// Cluster contract for a node running without peers.
///
/// Single-node gateways use this to run the session core without any
/// membership transport; every remote answer is "nothing out there".
pub struct StandaloneCluster {
    server_id: String,
}

impl StandaloneCluster {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl ClusterContract for StandaloneCluster {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn remote_session_is_alive(&self, _device_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn check_remote_session_is_alive(&self, _device_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn remove_remote_session(&self, _device_id: &str) -> Result<u64> {
        Ok(0)
    }

    async fn remote_total_sessions(&self) -> Result<u64> {
        Ok(0)
    }

    async fn remote_sessions(&self, _server_id: Option<&str>) -> Result<SessionInfoStream> {
        Ok(Box::pin(stream::empty()))
    }

    async fn init_session_connection(&self, _session: &SharedSession) -> Result<bool> {
        Ok(false)
    }
}
