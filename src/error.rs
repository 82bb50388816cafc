// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session Plane Error System
//!
//! A categorized, chainable error type for session management failures.
//! [`SessionError`] is `Clone` because load outcomes are broadcast to every
//! waiter of a session ref; it supports error chaining via the standard
//! [`std::error::Error::source()`] method.

use std::fmt;

/// Categorizes session errors into a fixed set of standard kinds.
///
/// Consumers inspect the kind to decide what action to take, rather than the
/// error defining its own behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The session producer did not emit within the configured load timeout.
    LoadTimeout,
    /// The session producer failed.
    LoadFailed,
    /// Write-through to the device operator failed.
    OperatorFailed,
    /// A cluster contract call failed.
    RemoteUnavailable,
    /// A session event handler failed. Always logged and swallowed locally.
    HandlerFailed,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorKind::LoadTimeout => write!(f, "LoadTimeout"),
            SessionErrorKind::LoadFailed => write!(f, "LoadFailed"),
            SessionErrorKind::OperatorFailed => write!(f, "OperatorFailed"),
            SessionErrorKind::RemoteUnavailable => write!(f, "RemoteUnavailable"),
            SessionErrorKind::HandlerFailed => write!(f, "HandlerFailed"),
        }
    }
}

/// The standardized error type for session management.
///
/// Carries a [`SessionErrorKind`] for categorization and an optional cause.
/// `Display` shows only the current error (standard Rust convention); use
/// `source()` to walk the chain.
#[derive(Debug, Clone)]
pub struct SessionError {
    kind: SessionErrorKind,
    message: String,
    caused_by: Option<Box<SessionError>>,
}

impl SessionError {
    /// Create a new error with the given kind and message, no cause.
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            caused_by: None,
        }
    }

    /// Create a new error with the given kind, message, and cause.
    ///
    /// If the cause is itself a `SessionError`, it is preserved as-is;
    /// otherwise its rendered chain becomes the cause message.
    pub fn caused(
        kind: SessionErrorKind,
        message: impl Into<String>,
        cause: &anyhow::Error,
    ) -> Self {
        let caused_by = match cause.downcast_ref::<SessionError>() {
            Some(inner) => inner.clone(),
            None => Self {
                kind,
                message: format!("{cause:#}"),
                caused_by: None,
            },
        };
        Self {
            kind,
            message: message.into(),
            caused_by: Some(Box::new(caused_by)),
        }
    }

    pub fn load_timeout(device_id: &str) -> Self {
        Self::new(
            SessionErrorKind::LoadTimeout,
            format!("device [{device_id}] session load timeout"),
        )
    }

    pub fn load_failed(device_id: &str, cause: &anyhow::Error) -> Self {
        Self::caused(
            SessionErrorKind::LoadFailed,
            format!("device [{device_id}] session load failed"),
            cause,
        )
    }

    pub fn operator_failed(device_id: &str, cause: &anyhow::Error) -> Self {
        Self::caused(
            SessionErrorKind::OperatorFailed,
            format!("device [{device_id}] operator write-through failed"),
            cause,
        )
    }

    pub fn remote_unavailable(what: &str, cause: &anyhow::Error) -> Self {
        Self::caused(
            SessionErrorKind::RemoteUnavailable,
            format!("cluster call failed for [{what}]"),
            cause,
        )
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SessionErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.caused_by
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
