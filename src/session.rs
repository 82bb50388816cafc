// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device session and device operator contracts.
//!
//! A [`DeviceSession`] is the live connection state for one device on one
//! node. Sessions are created by protocol adapters (MQTT, CoAP, TCP, ...)
//! and handed to the registry through `compute`; the registry owns their
//! lifecycle from then on. A [`DeviceOperator`] is the external directory
//! service that records "device D is online at node N" for global lookup.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared handle to a device session.
pub type SharedSession = Arc<dyn DeviceSession>;

/// The live connection state for one device on one node.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Identity of the device this session belongs to. Key into the registry.
    fn device_id(&self) -> &str;

    /// Identity of this particular session. A device that reconnects gets a
    /// new session id under the same device id.
    fn session_id(&self) -> &str;

    /// Peer address of the underlying connection, when there is one.
    fn client_address(&self) -> Option<SocketAddr> {
        None
    }

    /// The directory service tracking this device, or `None` for anonymous
    /// sessions that are only tracked locally.
    fn operator(&self) -> Option<Arc<dyn DeviceOperator>> {
        None
    }

    /// For child sessions multiplexed over a parent connection (e.g. devices
    /// behind a gateway), the device id of the parent session.
    fn parent_device_id(&self) -> Option<String> {
        None
    }

    /// When the underlying connection was established, unix millis.
    fn connect_time_ms(&self) -> Option<u64> {
        None
    }

    /// Probe whether the underlying connection is still usable. Sessions
    /// without a cheap probe report alive.
    async fn is_alive(&self) -> Result<bool> {
        Ok(true)
    }

    /// Whether `other` represents a different connection than this session.
    /// Drives the replacement write-through.
    fn is_changed(&self, other: &dyn DeviceSession) -> bool {
        self.session_id() != other.session_id()
    }

    /// Release transport resources. Called exactly once per removal path;
    /// must not block and must not fail.
    fn on_close(&self) {}
}

/// External directory service recording device locations.
#[async_trait]
pub trait DeviceOperator: Send + Sync {
    /// Record the device as online at `server_id`. `session_id` is `None`
    /// when re-warming an existing record.
    async fn online(
        &self,
        server_id: &str,
        session_id: Option<&str>,
        address: Option<SocketAddr>,
    ) -> Result<()>;

    /// Clear the online record.
    async fn offline(&self) -> Result<()>;

    /// The node the directory currently records the device against.
    async fn connection_server_id(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Snapshot of one session for info export across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub server_id: String,
    pub device_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_time_ms: Option<u64>,
}

impl SessionInfo {
    pub fn of(server_id: &str, session: &dyn DeviceSession) -> Self {
        Self {
            server_id: server_id.to_string(),
            device_id: session.device_id().to_string(),
            session_id: session.session_id().to_string(),
            address: session.client_address().map(|addr| addr.to_string()),
            connect_time_ms: session.connect_time_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSession;

    #[test]
    fn info_serialization_roundtrip() {
        let session = TestSession::new("dev-1", "s-1").with_address("1.2.3.4:5678".parse().unwrap());
        let info = SessionInfo::of("node-a", &session);

        let json = serde_json::to_string(&info).unwrap();
        let deserialized: SessionInfo = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, info);
        assert_eq!(deserialized.server_id, "node-a");
        assert_eq!(deserialized.device_id, "dev-1");
        assert_eq!(deserialized.address.as_deref(), Some("1.2.3.4:5678"));
    }

    #[test]
    fn info_omits_absent_address() {
        let session = TestSession::new("dev-2", "s-2");
        let info = SessionInfo::of("node-a", &session);

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("address"));
    }
}
