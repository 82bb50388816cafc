// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-device session cell: single-flight loading with multi-consumer
//! broadcast, atomic replacement, and identity-checked eviction.
//!
//! A [`SessionRef`] owns at most one "current" session and at most one
//! in-flight load. The pending load is held as a take-once closure; the
//! first subscriber consumes and spawns it, later subscribers await the same
//! broadcast slot. Replacing the load cancels the running task, resets the
//! slot, and signals empty to waiters latched on the prior slot. A ref whose
//! load fails or produces nothing removes itself from the registry before
//! the outcome is published, so a failed entry is never addressable.

use crate::error::SessionError;
use crate::manager::ManagerInner;
use crate::session::SharedSession;
use crate::Result;
use dashmap::DashSet;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Future producing the next session for a device, or `None` when the device
/// should be treated as offline.
pub type SessionFuture = BoxFuture<'static, Result<Option<SharedSession>>>;

/// Deferred load: receives the currently loaded session (if any) when the
/// load actually starts, not when it is installed.
pub type SessionComputer = Box<dyn FnOnce(Option<SharedSession>) -> SessionFuture + Send>;

/// Terminal outcome of one load, replayed to every subscriber.
#[derive(Clone)]
enum LoadOutcome {
    Value(SharedSession),
    Empty,
    Failed(SessionError),
}

type OutcomeSender = Arc<watch::Sender<Option<LoadOutcome>>>;

pub(crate) struct SessionRef {
    weak_self: Weak<SessionRef>,
    manager: Weak<ManagerInner>,
    device_id: String,
    /// Most recently resolved session, not yet replaced or closed.
    loaded: RwLock<Option<SharedSession>>,
    /// Broadcast slot for the current load. Swapped wholesale on `update`.
    slot: Mutex<OutcomeSender>,
    /// Pending load, consumed at most once.
    loader: Mutex<Option<SessionComputer>>,
    /// Running load task, aborted on replacement or close.
    load_task: Mutex<Option<JoinHandle<()>>>,
    /// Device ids of child sessions naming this device as parent.
    children: DashSet<String>,
}

impl SessionRef {
    pub(crate) fn new(
        device_id: impl Into<String>,
        manager: Weak<ManagerInner>,
        load: SessionComputer,
    ) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            manager,
            device_id: device_id.into(),
            loaded: RwLock::new(None),
            slot: Mutex::new(Arc::new(tx)),
            loader: Mutex::new(Some(load)),
            load_task: Mutex::new(None),
            children: DashSet::new(),
        })
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn loaded_session(&self) -> Option<SharedSession> {
        self.loaded.read().clone()
    }

    pub(crate) fn add_child(&self, device_id: String) {
        self.children.insert(device_id);
    }

    pub(crate) fn remove_child(&self, device_id: &str) {
        self.children.remove(device_id);
    }

    #[cfg(test)]
    pub(crate) fn children(&self) -> Vec<String> {
        self.children.iter().map(|id| id.key().clone()).collect()
    }

    /// Replace the pending load.
    ///
    /// Cancels any running load and resets the broadcast slot. Waiters
    /// latched on the prior slot observe empty, unless that load already
    /// completed (a terminated slot keeps its outcome).
    pub(crate) fn update(&self, load: SessionComputer) {
        self.abort_load();
        let (tx, _rx) = watch::channel(None);
        let previous = std::mem::replace(&mut *self.slot.lock(), Arc::new(tx));
        Self::publish(&previous, LoadOutcome::Empty);
        *self.loader.lock() = Some(load);
    }

    pub(crate) fn abort_load(&self) {
        if let Some(task) = self.load_task.lock().take() {
            task.abort();
        }
    }

    /// Subscribe to the current load, starting it if nobody has yet.
    ///
    /// Every subscriber of one load observes the same outcome; a completed
    /// slot replays it.
    pub(crate) async fn resolve(&self) -> Result<Option<SharedSession>> {
        self.try_load();
        let mut rx = self.slot.lock().subscribe();
        let outcome = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => (*value).clone(),
            // Sender gone without an outcome: the slot was replaced.
            Err(_) => None,
        };
        match outcome {
            Some(LoadOutcome::Value(session)) => Ok(Some(session)),
            Some(LoadOutcome::Failed(err)) => Err(err.into()),
            Some(LoadOutcome::Empty) | None => Ok(None),
        }
    }

    /// Consume the pending load, if any, and drive it on a background task.
    fn try_load(&self) {
        let Some(pending) = self.loader.lock().take() else {
            return;
        };
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let current = self.loaded.read().clone();
        let fut = pending(current);
        let tx = self.slot.lock().clone();
        let timeout = manager.load_timeout();

        let task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, this.drive(fut)).await {
                Err(_elapsed) => {
                    let err = SessionError::load_timeout(&this.device_id);
                    this.load_error(err, &tx);
                }
                Ok(Err(err)) => {
                    let err = match err.downcast::<SessionError>() {
                        Ok(session_err) => session_err,
                        Err(other) => SessionError::load_failed(&this.device_id, &other),
                    };
                    this.load_error(err, &tx);
                }
                Ok(Ok(None)) => this.load_empty(&tx),
                Ok(Ok(Some(session))) => this.after_loaded(session, &tx),
            }
        });
        *self.load_task.lock() = Some(task);
    }

    /// Producer plus the register/replacement write-through, all bounded by
    /// the load timeout.
    async fn drive(&self, fut: SessionFuture) -> Result<Option<SharedSession>> {
        let Some(produced) = fut.await? else {
            return Ok(None);
        };
        let Some(manager) = self.manager.upgrade() else {
            return Ok(None);
        };
        let session = self.handle_loaded(&manager, produced).await?;
        Ok(Some(session))
    }

    async fn handle_loaded(
        &self,
        manager: &Arc<ManagerInner>,
        session: SharedSession,
    ) -> Result<SharedSession> {
        let old = self.loaded.write().replace(session.clone());
        manager.with_parent_ref(&*session, |parent| {
            parent.add_child(session.device_id().to_string());
        });
        if old.is_none() {
            manager.do_register(&session).await?;
            manager.handle_session_compute(None, session).await
        } else {
            manager.handle_session_compute(old, session).await
        }
    }

    fn after_loaded(&self, session: SharedSession, tx: &OutcomeSender) {
        {
            let mut loaded = self.loaded.write();
            if let Some(current) = loaded.as_ref() {
                if !Arc::ptr_eq(current, &session) {
                    current.on_close();
                }
            }
            *loaded = Some(session.clone());
        }
        Self::publish(tx, LoadOutcome::Value(session));
    }

    fn load_empty(&self, tx: &OutcomeSender) {
        if let Some(current) = self.loaded.write().take() {
            current.on_close();
        }
        self.evict();
        Self::publish(tx, LoadOutcome::Empty);
    }

    fn load_error(&self, err: SessionError, tx: &OutcomeSender) {
        if let Some(current) = self.loaded.write().take() {
            current.on_close();
        }
        self.evict();
        Self::publish(tx, LoadOutcome::Failed(err));
    }

    /// Terminate a slot. First outcome wins; a slot that was already
    /// terminated (e.g. emptied by a replacement) keeps its outcome.
    fn publish(tx: &OutcomeSender, outcome: LoadOutcome) {
        tx.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    /// Compare-and-remove this ref from the registry. Runs before the
    /// outcome is published so a failed entry is never observable.
    fn evict(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_ref_if_same(&self.device_id, self);
        }
    }

    /// Evict only if `expected` is still the current session and the
    /// registry still points at this ref.
    pub(crate) async fn close_if(&self, expected: &SharedSession) -> Result<u64> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(0);
        };
        let matches = self
            .loaded
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, expected));
        if !matches || !manager.remove_ref_if_same(&self.device_id, self) {
            return Ok(0);
        }
        self.abort_load();
        self.do_close(&manager, expected.clone()).await
    }

    /// Unconditional evict; the caller has already detached this ref from
    /// the registry.
    pub(crate) async fn close(&self) -> Result<u64> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(0);
        };
        self.abort_load();
        let Some(session) = self.loaded.read().clone() else {
            return Ok(0);
        };
        self.do_close(&manager, session).await
    }

    async fn do_close(&self, manager: &Arc<ManagerInner>, session: SharedSession) -> Result<u64> {
        manager.with_parent_ref(&*session, |parent| {
            parent.remove_child(session.device_id());
        });
        manager.close_session(session).await?;
        self.check_children(manager).await?;
        Ok(1)
    }

    /// Probe the liveness of every child session; dead children are evicted
    /// by their own refs.
    async fn check_children(&self, manager: &Arc<ManagerInner>) -> Result<()> {
        if self.children.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = self.children.iter().map(|id| id.key().clone()).collect();
        for id in ids {
            manager.check_session_alive_by_id(&id).await?;
        }
        Ok(())
    }
}
