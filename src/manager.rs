// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-node device session manager.
//!
//! Tracks which devices are online against this node, mediates concurrent
//! registration, lookup, liveness checking and eviction, and consults the
//! [`ClusterContract`] for everything beyond the node boundary. The
//! registry maps device id to a [`SessionRef`]; the ref's per-key map slot
//! is the serialization point for all mutation of one device.
//!
//! ```ignore
//! let manager = DeviceSessionManager::standalone(SessionManagerConfig::default());
//! manager.init();
//! let session = manager
//!     .compute("dev-1", Some(Box::pin(async move { Ok(Some(session)) })), None)
//!     .await?;
//! ```

use crate::cluster::{ClusterContract, SessionInfoStream, StandaloneCluster};
use crate::config::SessionManagerConfig;
use crate::error::SessionError;
use crate::events::{EventBus, EventHandler, ListenerHandle, SessionEvent};
use crate::session::{DeviceSession, SessionInfo, SharedSession};
use crate::session_ref::{SessionComputer, SessionFuture, SessionRef};
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stream of locally resolved sessions.
pub type SessionStream = Pin<Box<dyn Stream<Item = Result<SharedSession>> + Send>>;

/// Replacement function applied to the currently loaded session.
pub type SessionUpdater = Box<dyn FnOnce(SharedSession) -> SessionFuture + Send>;

/// Hook invoked after a load or replacement resolves, with the prior session
/// (if any) and the new one. May substitute the session that is ultimately
/// installed and handed to waiters.
pub type SessionComputeHook = Arc<
    dyn Fn(Option<SharedSession>, SharedSession) -> BoxFuture<'static, Result<SharedSession>>
        + Send
        + Sync,
>;

/// Tracks local device sessions and mediates cluster-wide session state.
#[derive(Clone)]
pub struct DeviceSessionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: SessionManagerConfig,
    cluster: Arc<dyn ClusterContract>,
    sessions: DashMap<String, Arc<SessionRef>>,
    events: Arc<EventBus>,
    compute_hook: RwLock<Option<SessionComputeHook>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DeviceSessionManager {
    pub fn new(config: SessionManagerConfig, cluster: Arc<dyn ClusterContract>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                cluster,
                sessions: DashMap::new(),
                events: EventBus::new(),
                compute_hook: RwLock::new(None),
                sweeper: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// A manager for a node without peers; `config.server_id` becomes the
    /// node identity.
    pub fn standalone(config: SessionManagerConfig) -> Self {
        let cluster = Arc::new(StandaloneCluster::new(config.server_id.clone()));
        Self::new(config, cluster)
    }

    /// Install the compute hook. Call before `init`.
    pub fn set_compute_hook(&self, hook: SessionComputeHook) {
        *self.inner.compute_hook.write() = Some(hook);
    }

    /// Stable identifier of this node.
    pub fn server_id(&self) -> &str {
        self.inner.cluster.server_id()
    }

    /// Start the liveness sweeper. Must be called within a tokio runtime.
    pub fn init(&self) {
        let period = self.inner.config.session_check_interval();
        let token = self.inner.shutdown.clone();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.check_sessions().await;
                    }
                }
            }
        });
        if let Some(previous) = self.inner.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the sweeper. In-flight loads are not force-cancelled but their
    /// results are ignored by callers that have gone away.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
    }

    /// Resolve the device's session, evicting it if the liveness probe fails.
    pub async fn get_session(&self, device_id: &str) -> Result<Option<SharedSession>> {
        self.get_session_with(device_id, true).await
    }

    /// Resolve the device's session. With `unregister_when_not_alive`, a dead
    /// session yields `None` and is evicted as a side effect.
    pub async fn get_session_with(
        &self,
        device_id: &str,
        unregister_when_not_alive: bool,
    ) -> Result<Option<SharedSession>> {
        if device_id.is_empty() {
            return Ok(None);
        }
        let Some(session_ref) = self
            .inner
            .sessions
            .get(device_id)
            .map(|entry| entry.value().clone())
        else {
            return Ok(None);
        };
        let Some(session) = session_ref.resolve().await? else {
            return Ok(None);
        };
        if unregister_when_not_alive && !self.inner.check_session_alive(&session).await? {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// All locally resolved sessions.
    pub fn get_sessions(&self) -> SessionStream {
        let refs: Vec<Arc<SessionRef>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        Box::pin(stream::iter(refs).filter_map(|session_ref| async move {
            match session_ref.resolve().await {
                Ok(Some(session)) => Some(Ok(session)),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            }
        }))
    }

    /// Install or replace the device's session.
    ///
    /// With no prior session and a `creator`, the creator is installed as the
    /// pending load; with a prior session and an `updater`, the prior ref is
    /// atomically re-pointed at the updater. Anything else leaves the
    /// registry untouched and yields `None` (or the existing session).
    pub async fn compute(
        &self,
        device_id: &str,
        creator: Option<SessionFuture>,
        updater: Option<SessionUpdater>,
    ) -> Result<Option<SharedSession>> {
        let session_ref = match self.inner.sessions.entry(device_id.to_string()) {
            Entry::Occupied(occupied) => {
                let existing = occupied.get().clone();
                if let Some(updater) = updater {
                    existing.update(Box::new(move |current| {
                        Box::pin(async move {
                            match current {
                                Some(session) => updater(session).await,
                                None => Ok(None),
                            }
                        })
                    }));
                }
                Some(existing)
            }
            Entry::Vacant(vacant) => match creator {
                Some(creator) => {
                    let created = SessionRef::new(
                        device_id,
                        Arc::downgrade(&self.inner),
                        Box::new(move |_current| creator),
                    );
                    vacant.insert(created.clone());
                    Some(created)
                }
                None => None,
            },
        };
        match session_ref {
            Some(session_ref) => session_ref.resolve().await,
            None => Ok(None),
        }
    }

    /// Install or replace through a single function of the current state.
    pub async fn compute_with(
        &self,
        device_id: &str,
        computer: SessionComputer,
    ) -> Result<Option<SharedSession>> {
        let session_ref = match self.inner.sessions.entry(device_id.to_string()) {
            Entry::Occupied(occupied) => {
                let existing = occupied.get().clone();
                existing.update(computer);
                existing
            }
            Entry::Vacant(vacant) => {
                let created = SessionRef::new(device_id, Arc::downgrade(&self.inner), computer);
                vacant.insert(created.clone());
                created
            }
        };
        session_ref.resolve().await
    }

    /// Evict the device's session locally and, unless `only_local`, on every
    /// other node. Returns the total number of sessions removed.
    pub async fn remove(&self, device_id: &str, only_local: bool) -> Result<u64> {
        let local = self.inner.remove_local_session(device_id).await?;
        if only_local {
            return Ok(local);
        }
        let remote = self
            .inner
            .cluster
            .remove_remote_session(device_id)
            .await
            .map_err(|err| SessionError::remote_unavailable(device_id, &err))?;
        Ok(local + remote)
    }

    /// Whether the device has a session, here or (unless `only_local`)
    /// anywhere in the cluster. Existence check only, no liveness probe; a
    /// failed remote query degrades to `false`.
    pub async fn is_alive(&self, device_id: &str, only_local: bool) -> Result<bool> {
        let local = self.get_session_with(device_id, false).await?.is_some();
        if local || only_local {
            return Ok(local);
        }
        match self.inner.cluster.remote_session_is_alive(device_id).await {
            Ok(alive) => Ok(alive),
            Err(err) => {
                tracing::warn!(
                    "remote liveness query for device [{}] failed, treating as offline: {:#}",
                    device_id,
                    err
                );
                Ok(false)
            }
        }
    }

    /// Stronger liveness: requires the operator write-through to succeed,
    /// which also keeps the directory record fresh. Falls back to the
    /// authoritative remote probe unless `only_local`.
    pub async fn check_alive(&self, device_id: &str, only_local: bool) -> Result<bool> {
        let local = self.check_local_alive(device_id).await?;
        if local || only_local {
            return Ok(local);
        }
        self.inner
            .cluster
            .check_remote_session_is_alive(device_id)
            .await
            .map_err(|err| SessionError::remote_unavailable(device_id, &err).into())
    }

    async fn check_local_alive(&self, device_id: &str) -> Result<bool> {
        let Some(session) = self.get_session(device_id).await? else {
            return Ok(false);
        };
        let Some(operator) = session.operator() else {
            return Ok(false);
        };
        operator
            .online(
                self.inner.cluster.server_id(),
                Some(device_id),
                session.client_address(),
            )
            .await
            .map_err(|err| SessionError::operator_failed(device_id, &err))?;
        Ok(true)
    }

    /// Number of sessions on this node, plus the cluster-wide count unless
    /// `only_local`.
    pub async fn total_sessions(&self, only_local: bool) -> Result<u64> {
        let local = self.inner.sessions.len() as u64;
        if only_local {
            return Ok(local);
        }
        let remote = self
            .inner
            .cluster
            .remote_total_sessions()
            .await
            .map_err(|err| SessionError::remote_unavailable("*", &err))?;
        Ok(local + remote)
    }

    /// Local session snapshot followed by the remote enumeration, optionally
    /// restricted to one node.
    pub async fn session_info(&self, server_id: Option<&str>) -> Result<SessionInfoStream> {
        let local: Vec<Result<SessionInfo>> = self
            .inner
            .local_session_info()
            .into_iter()
            .map(Ok)
            .collect();
        let remote = self.inner.cluster.remote_sessions(server_id).await?;
        Ok(Box::pin(stream::iter(local).chain(remote)))
    }

    /// Register a lifecycle event handler. The handler stays registered
    /// until the returned handle is disposed.
    pub fn listen_event(&self, handler: EventHandler) -> ListenerHandle {
        EventBus::listen(&self.inner.events, handler)
    }

    /// Handle a cluster-initiated eviction: a peer decided this device's
    /// session must go. The operator record is only cleared when it still
    /// points at this node.
    pub async fn remove_from_cluster(&self, device_id: &str) -> Result<u64> {
        let Some((_, session_ref)) = self.inner.sessions.remove(device_id) else {
            return Ok(0);
        };
        session_ref.abort_load();
        let Some(session) = session_ref.loaded_session() else {
            return Ok(0);
        };
        session.on_close();
        let Some(operator) = session.operator() else {
            return Ok(1);
        };
        let same_server = operator
            .connection_server_id()
            .await?
            .is_some_and(|recorded| recorded == self.inner.cluster.server_id());
        if same_server {
            operator
                .offline()
                .await
                .map_err(|err| SessionError::operator_failed(device_id, &err))?;
        }
        self.inner
            .fire_event(SessionEvent::unregister(session, !same_server))
            .await;
        Ok(1)
    }

    /// Re-warm the operator's directory record for an already loaded
    /// session. Returns whether a record was written.
    pub async fn init_session_record(&self, device_id: &str) -> Result<bool> {
        let Some(session_ref) = self
            .inner
            .sessions
            .get(device_id)
            .map(|entry| entry.value().clone())
        else {
            return Ok(false);
        };
        let Some(session) = session_ref.loaded_session() else {
            return Ok(false);
        };
        let Some(operator) = session.operator() else {
            return Ok(false);
        };
        operator
            .online(self.inner.cluster.server_id(), None, None)
            .await
            .map_err(|err| SessionError::operator_failed(device_id, &err))?;
        Ok(true)
    }
}

impl ManagerInner {
    pub(crate) fn load_timeout(&self) -> std::time::Duration {
        self.config.session_load_timeout()
    }

    pub(crate) fn remove_ref_if_same(&self, device_id: &str, expected: &SessionRef) -> bool {
        self.sessions
            .remove_if(device_id, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), expected)
            })
            .is_some()
    }

    /// Run `f` against the ref of the session's parent, when the session is a
    /// child and its parent is locally registered.
    pub(crate) fn with_parent_ref(
        &self,
        session: &dyn DeviceSession,
        f: impl FnOnce(&Arc<SessionRef>),
    ) {
        let Some(parent_id) = session.parent_device_id() else {
            return;
        };
        let Some(parent) = self
            .sessions
            .get(&parent_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        f(&parent);
    }

    /// First-load write-through: record the device online, then announce the
    /// registration with the gossip-known remote state.
    pub(crate) async fn do_register(&self, session: &SharedSession) -> Result<()> {
        let Some(operator) = session.operator() else {
            return Ok(());
        };
        let remote_exists = self
            .cluster
            .remote_session_is_alive(session.device_id())
            .await?;
        operator
            .online(
                self.cluster.server_id(),
                Some(session.session_id()),
                session.client_address(),
            )
            .await
            .map_err(|err| SessionError::operator_failed(session.device_id(), &err))?;
        self.fire_event(SessionEvent::register(session.clone(), remote_exists))
            .await;
        Ok(())
    }

    /// Replacement write-through plus the configurable compute hook.
    pub(crate) async fn handle_session_compute(
        &self,
        old: Option<SharedSession>,
        session: SharedSession,
    ) -> Result<SharedSession> {
        if let Some(old_session) = old.as_ref() {
            if old_session.is_changed(&*session) {
                if let Some(operator) = session.operator() {
                    tracing::info!(
                        "device [{}] session [{}] changed to [{}]",
                        session.device_id(),
                        old_session.session_id(),
                        session.session_id()
                    );
                    old_session.on_close();
                    operator
                        .online(
                            self.cluster.server_id(),
                            Some(session.session_id()),
                            session.client_address(),
                        )
                        .await
                        .map_err(|err| {
                            SessionError::operator_failed(session.device_id(), &err)
                        })?;
                }
            }
        }
        let hook = self.compute_hook.read().clone();
        match hook {
            Some(hook) => hook(old, session).await,
            None => Ok(session),
        }
    }

    /// Close a session that has been detached from the registry and decide
    /// how its unregister is reported.
    pub(crate) async fn close_session(&self, session: SharedSession) -> Result<()> {
        session.on_close();
        let Some(operator) = session.operator() else {
            return Ok(());
        };
        let remote_alive = self.cluster.init_session_connection(&session).await?;
        // The registry may already hold a fresh ref for this device if it
        // re-registered in the same tick; the device then counts as still
        // online even though the key alone cannot tell the two refs apart.
        let still_exists = remote_alive || self.sessions.contains_key(session.device_id());
        if still_exists {
            tracing::info!(
                "device [{}] session [{}] closed, but session still exists",
                session.device_id(),
                session.session_id()
            );
            self.fire_event(SessionEvent::unregister(session, true)).await;
        } else {
            operator
                .offline()
                .await
                .map_err(|err| SessionError::operator_failed(session.device_id(), &err))?;
            tracing::info!(
                "device [{}] session [{}] closed",
                session.device_id(),
                session.session_id()
            );
            self.fire_event(SessionEvent::unregister(session, false)).await;
        }
        Ok(())
    }

    /// Probe one session; a dead one is evicted and reported as such.
    pub(crate) async fn check_session_alive(&self, session: &SharedSession) -> Result<bool> {
        if session.is_alive().await? {
            return Ok(true);
        }
        self.remove_local_session_of(session).await?;
        Ok(false)
    }

    /// Probe by device id. Boxed: eviction of a parent probes its children,
    /// which may recurse into this function.
    pub(crate) fn check_session_alive_by_id<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(session_ref) = self
                .sessions
                .get(device_id)
                .map(|entry| entry.value().clone())
            else {
                return Ok(false);
            };
            let Some(session) = session_ref.loaded_session() else {
                return Ok(false);
            };
            self.check_session_alive(&session).await
        })
    }

    async fn remove_local_session_of(&self, session: &SharedSession) -> Result<u64> {
        let Some(session_ref) = self
            .sessions
            .get(session.device_id())
            .map(|entry| entry.value().clone())
        else {
            return Ok(0);
        };
        session_ref.close_if(session).await
    }

    pub(crate) async fn remove_local_session(&self, device_id: &str) -> Result<u64> {
        let Some((_, session_ref)) = self.sessions.remove(device_id) else {
            return Ok(0);
        };
        session_ref.close().await
    }

    /// One sweep over every loaded session. A failing session must not halt
    /// the sweep, so every error is logged and swallowed here.
    pub(crate) async fn check_sessions(&self) {
        let refs: Vec<Arc<SessionRef>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session_ref in refs {
            let Some(session) = session_ref.loaded_session() else {
                continue;
            };
            if let Err(err) = self.check_session_alive(&session).await {
                tracing::warn!(
                    "liveness check for device [{}] failed: {:#}",
                    session_ref.device_id(),
                    err
                );
            }
        }
    }

    pub(crate) fn local_session_info(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().loaded_session())
            .map(|session| SessionInfo::of(self.cluster.server_id(), &*session))
            .collect()
    }

    pub(crate) async fn fire_event(&self, event: SessionEvent) {
        self.events.fire(event).await;
    }
}
