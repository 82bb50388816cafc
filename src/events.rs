// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle events and handler fan-out.
//!
//! Handlers run in registration order with per-handler error isolation: a
//! failing handler is logged and the rest continue. No handler may assume
//! exclusivity.

use crate::session::SharedSession;
use crate::Result;
use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle transition of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Register,
    Unregister,
}

/// A session lifecycle event.
///
/// `remote_exists` means: after this event the device is (re)known to be
/// online on some other node.
#[derive(Clone)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: SharedSession,
    pub remote_exists: bool,
}

impl SessionEvent {
    pub fn register(session: SharedSession, remote_exists: bool) -> Self {
        Self {
            kind: SessionEventKind::Register,
            session,
            remote_exists,
        }
    }

    pub fn unregister(session: SharedSession, remote_exists: bool) -> Self {
        Self {
            kind: SessionEventKind::Unregister,
            session,
            remote_exists,
        }
    }
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEvent")
            .field("kind", &self.kind)
            .field("device_id", &self.session.device_id())
            .field("session_id", &self.session.session_id())
            .field("remote_exists", &self.remote_exists)
            .finish()
    }
}

/// Asynchronous handler invoked for every fired event.
pub type EventHandler = Arc<dyn Fn(SessionEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registration handle returned by `listen_event`. The handler stays
/// registered until `dispose` is called; dropping the handle keeps it alive.
pub struct ListenerHandle {
    bus: Weak<EventBus>,
    id: u64,
}

impl ListenerHandle {
    pub fn dispose(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

pub(crate) struct EventBus {
    handlers: RwLock<Vec<(u64, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn listen(bus: &Arc<EventBus>, handler: EventHandler) -> ListenerHandle {
        let id = bus.next_id.fetch_add(1, Ordering::Relaxed);
        bus.handlers.write().push((id, handler));
        ListenerHandle {
            bus: Arc::downgrade(bus),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.handlers.write().retain(|(handler_id, _)| *handler_id != id);
    }

    /// Fan an event out to every handler, in registration order, isolating
    /// failures. Resolves once all handlers have completed.
    pub(crate) async fn fire(&self, event: SessionEvent) {
        let handlers: Vec<EventHandler> = {
            let guard = self.handlers.read();
            if guard.is_empty() {
                return;
            }
            guard.iter().map(|(_, handler)| handler.clone()).collect()
        };
        join_all(handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                let device_id = event.session.device_id().to_string();
                if let Err(err) = handler(event).await {
                    tracing::error!(
                        "session event handler failed for device [{}]: {:#}",
                        device_id,
                        err
                    );
                }
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSession;
    use parking_lot::Mutex;

    fn test_event() -> SessionEvent {
        SessionEvent::register(Arc::new(TestSession::new("dev-1", "s-1")), false)
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let _handle = EventBus::listen(&bus, Arc::new(move |_event| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().push(tag);
                    Ok(())
                })
            }));
        }

        bus.fire(test_event()).await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let called = Arc::new(Mutex::new(Vec::new()));

        let _failing = EventBus::listen(&bus, Arc::new(|_event| {
            Box::pin(async { Err(anyhow::anyhow!("handler exploded")) })
        }));
        let sink = called.clone();
        let _ok = EventBus::listen(&bus, Arc::new(move |_event| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push("ok");
                Ok(())
            })
        }));

        bus.fire(test_event()).await;
        assert_eq!(*called.lock(), vec!["ok"]);
    }

    #[tokio::test]
    async fn dispose_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0u32));

        let sink = count.clone();
        let handle = EventBus::listen(&bus, Arc::new(move |_event| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock() += 1;
                Ok(())
            })
        }));

        bus.fire(test_event()).await;
        handle.dispose();
        bus.fire(test_event()).await;

        assert_eq!(*count.lock(), 1);
    }
}
