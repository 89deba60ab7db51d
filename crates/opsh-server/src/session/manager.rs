//! Terminal session lifecycle management.
//!
//! Tracks all live sessions, indexed by id and by owning user, handles
//! creation under a per-user quota, explicit close, idle eviction, and
//! shutdown. Both indexes live behind one lock so no caller ever sees one
//! updated without the other. A session whose shell has exited but which
//! has not been deregistered yet is invisible to lookups and the quota.

use super::pty::ShellCommand;
use super::terminal::{SessionOptions, TerminalSession};
use crate::config::TerminalConfig;
use futures_util::future::join_all;
use opsh_core::{generate_id, OpshError, OpshResult, SessionInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session registry plus the per-user index over it.
#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<TerminalSession>>,
    by_user: HashMap<String, Vec<String>>,
}

impl Registry {
    fn insert(&mut self, session: Arc<TerminalSession>) {
        self.by_user
            .entry(session.user_id().to_string())
            .or_default()
            .push(session.id().to_string());
        self.sessions.insert(session.id().to_string(), session);
    }

    fn remove(&mut self, session_id: &str) -> Option<Arc<TerminalSession>> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_user.get_mut(session.user_id()) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                self.by_user.remove(session.user_id());
            }
        }
        Some(session)
    }

    /// Open sessions for `user_id`, in creation order.
    fn user_sessions(&self, user_id: &str) -> Vec<Arc<TerminalSession>> {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id))
                    .filter(|s| !s.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn user_count(&self, user_id: &str) -> usize {
        self.user_sessions(user_id).len()
    }
}

/// How long shutdown waits for hung-up shells before killing what is left.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How long shutdown waits for killed shells to be reaped.
const SHUTDOWN_REAP: Duration = Duration::from_secs(3);

/// Manages all terminal sessions.
pub struct TerminalSessionManager {
    registry: Arc<RwLock<Registry>>,
    config: TerminalConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSessionManager {
    /// Create a new session manager. The idle sweeper is not started.
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn a shell for `user_id` and register it.
    pub async fn create_session(
        &self,
        user_id: &str,
        username: &str,
    ) -> OpshResult<Arc<TerminalSession>> {
        if !self.config.enabled {
            return Err(OpshError::TerminalDisabled);
        }

        // Held across the spawn so two concurrent creates cannot both pass
        // the quota check.
        let mut registry = self.registry.write().await;
        let limit = self.config.max_sessions_per_user;
        if registry.user_count(user_id) >= limit {
            warn!(user_id, limit, "terminal session quota exceeded");
            return Err(OpshError::QuotaExceeded {
                user_id: user_id.to_string(),
                limit,
            });
        }

        let session_id = new_session_id();
        let opts = SessionOptions {
            user_id: user_id.to_string(),
            username: username.to_string(),
            shell: ShellCommand {
                program: self.config.shell.clone(),
                args: self.config.args.clone(),
                env: self.config.env.clone(),
                working_dir: self.config.working_dir.clone(),
            },
            cols: self.config.cols,
            rows: self.config.rows,
            replay_bytes: self.config.replay_buffer_bytes,
            subscriber_capacity: self.config.subscriber_capacity,
        };

        let weak = Arc::downgrade(&self.registry);
        let runtime = tokio::runtime::Handle::current();
        let on_exit = Box::new(move |id: &str| {
            let id = id.to_string();
            runtime.spawn(deregister_exited(weak, id));
        });

        let session = TerminalSession::spawn(session_id.clone(), opts, on_exit)?;
        registry.insert(session.clone());

        info!(session_id = %session_id, user_id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> OpshResult<Arc<TerminalSession>> {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .filter(|s| !s.is_closed())
            .cloned()
            .ok_or_else(|| OpshError::SessionNotFound(session_id.to_string()))
    }

    /// All open sessions owned by `user_id`, in creation order.
    pub async fn get_user_sessions(&self, user_id: &str) -> Vec<Arc<TerminalSession>> {
        self.registry.read().await.user_sessions(user_id)
    }

    /// Info for every open session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let registry = self.registry.read().await;
        let mut infos: Vec<SessionInfo> = registry
            .sessions
            .values()
            .filter(|s| !s.is_closed())
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Close a session and remove it from the registry.
    pub async fn close_session(&self, session_id: &str) -> OpshResult<()> {
        let session = self
            .registry
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| OpshError::SessionNotFound(session_id.to_string()))?;
        session.close();
        info!(session_id, "session removed");
        Ok(())
    }

    /// Get the number of open sessions.
    pub async fn count(&self) -> usize {
        self.registry
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// One idle sweep pass at the current time.
    pub async fn sweep_idle(&self) -> Vec<String> {
        self.sweep_idle_at(Instant::now()).await
    }

    /// Close and deregister every session idle for longer than the TTL,
    /// measured against `now`. Returns the evicted ids.
    pub async fn sweep_idle_at(&self, now: Instant) -> Vec<String> {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let mut registry = self.registry.write().await;

        let expired: Vec<String> = registry
            .sessions
            .values()
            .filter(|s| s.idle_for(now) > ttl)
            .map(|s| s.id().to_string())
            .collect();

        for id in &expired {
            if let Some(session) = registry.remove(id) {
                warn!(session_id = %id, idle_secs = session.idle_for(now).as_secs(), "session expired (idle)");
                session.close();
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "idle sweep removed sessions");
        }
        expired
    }

    /// Start the periodic idle sweep. Calling it again is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let manager = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_idle().await;
            }
        }));
        info!(interval_secs = period.as_secs(), ttl_secs = self.config.idle_ttl_secs, "idle sweeper started");
    }

    /// Stop the sweeper, close every session and wait for the shells to be
    /// reaped. Anything still running after a grace period is killed.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let sessions: Vec<Arc<TerminalSession>> = {
            let mut registry = self.registry.write().await;
            registry.by_user.clear();
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.close();
        }
        join_all(sessions.iter().map(|s| s.wait_exited(SHUTDOWN_GRACE))).await;

        // Shells that ignored the hang-up, and jobs they left behind.
        for session in &sessions {
            session.kill();
        }
        let reaped = join_all(sessions.iter().map(|s| s.wait_exited(SHUTDOWN_REAP))).await;
        let stuck = reaped.iter().filter(|done| !**done).count();
        if stuck > 0 {
            warn!(stuck, "shells not reaped at shutdown");
        }
        info!(closed = sessions.len(), "session manager shut down");
    }
}

/// Remove a session whose shell exited on its own.
async fn deregister_exited(registry: Weak<RwLock<Registry>>, session_id: String) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    if registry.write().await.remove(&session_id).is_some() {
        info!(session_id = %session_id, "session removed after shell exit");
    }
}

/// Generate a random session ID.
pub(crate) fn new_session_id() -> String {
    generate_id()
}
