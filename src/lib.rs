// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session Plane
//!
//! Distributed device session management for gateway fleets. Every node
//! tracks which remotely connected devices are online against it in a
//! [`manager::DeviceSessionManager`]; the [`cluster::ClusterContract`]
//! answers everything beyond the node boundary, and a device operator
//! directory is kept in sync through write-throughs on register, replace
//! and unregister.

pub use anyhow::{anyhow as error, bail as raise, Context as ErrorContext, Error, Result};

pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod session;
mod session_ref;
pub mod testing;

pub use cluster::{ClusterContract, MockCluster, SessionInfoStream, StandaloneCluster};
pub use config::SessionManagerConfig;
pub use error::{SessionError, SessionErrorKind};
pub use events::{EventHandler, ListenerHandle, SessionEvent, SessionEventKind};
pub use manager::{
    DeviceSessionManager, SessionComputeHook, SessionStream, SessionUpdater,
};
pub use session::{DeviceOperator, DeviceSession, SessionInfo, SharedSession};
pub use session_ref::{SessionComputer, SessionFuture};
