// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for exercising the session manager without a real device
//! transport or directory service.

use crate::session::{DeviceOperator, DeviceSession};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Scriptable in-memory device session. Starts alive; tests flip liveness
/// and observe close calls.
pub struct TestSession {
    device_id: String,
    session_id: String,
    address: Option<SocketAddr>,
    operator: Option<Arc<dyn DeviceOperator>>,
    parent: Option<String>,
    connect_time_ms: Option<u64>,
    alive: AtomicBool,
    closed: AtomicU32,
}

impl TestSession {
    pub fn new(device_id: &str, session_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            address: None,
            operator: None,
            parent: None,
            connect_time_ms: None,
            alive: AtomicBool::new(true),
            closed: AtomicU32::new(0),
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn DeviceOperator>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_parent(mut self, parent_device_id: &str) -> Self {
        self.parent = Some(parent_device_id.to_string());
        self
    }

    pub fn with_connect_time(mut self, connect_time_ms: u64) -> Self {
        self.connect_time_ms = Some(connect_time_ms);
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// How many times any removal path closed this session.
    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSession for TestSession {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn client_address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn operator(&self) -> Option<Arc<dyn DeviceOperator>> {
        self.operator.clone()
    }

    fn parent_device_id(&self) -> Option<String> {
        self.parent.clone()
    }

    fn connect_time_ms(&self) -> Option<u64> {
        self.connect_time_ms
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }

    fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// One recorded `online` write-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineCall {
    pub server_id: String,
    pub session_id: Option<String>,
    pub address: Option<SocketAddr>,
}

/// Device operator that records every directory write.
#[derive(Default)]
pub struct RecordingOperator {
    online_calls: Mutex<Vec<OnlineCall>>,
    offline_calls: AtomicU32,
    connection_server_id: Mutex<Option<String>>,
    fail_online: AtomicBool,
}

impl RecordingOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online_calls(&self) -> Vec<OnlineCall> {
        self.online_calls.lock().clone()
    }

    pub fn offline_count(&self) -> u32 {
        self.offline_calls.load(Ordering::SeqCst)
    }

    pub fn set_connection_server_id(&self, server_id: Option<String>) {
        *self.connection_server_id.lock() = server_id;
    }

    pub fn set_fail_online(&self, fail: bool) {
        self.fail_online.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceOperator for RecordingOperator {
    async fn online(
        &self,
        server_id: &str,
        session_id: Option<&str>,
        address: Option<SocketAddr>,
    ) -> Result<()> {
        if self.fail_online.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("directory rejected online call"));
        }
        self.online_calls.lock().push(OnlineCall {
            server_id: server_id.to_string(),
            session_id: session_id.map(str::to_string),
            address,
        });
        Ok(())
    }

    async fn offline(&self) -> Result<()> {
        self.offline_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connection_server_id(&self) -> Result<Option<String>> {
        Ok(self.connection_server_id.lock().clone())
    }
}
