//! The session registry: one session per test id, created on first use,
//! destroyed on demand or after idling past the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::protocol::startup::upstream_application_name;
use crate::proxy::session::Session;
use crate::upstream::{UpstreamConfig, UpstreamConnection, UpstreamError};

const CLEANUP_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_database: String,
    pub postgres_user: String,
    pub postgres_password: Option<String>,
    /// Backend idle_in_transaction_session_timeout.
    pub session_timeout: Duration,
    /// Idle window after which a session is evicted.
    pub idle_timeout: Duration,
    /// Upstream ping interval; zero disables keepalive.
    pub keepalive_interval: Duration,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("test id must not be empty")]
    EmptyTestId,
    #[error("session not found for test id '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Point-in-time view of a session, for status/list/admin replies.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub test_id: String,
    pub active: bool,
    pub level: u32,
    pub created_at: String,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Returns the session for the test id, creating it (and its upstream
    /// connection with a fresh base transaction) on first use. A session
    /// whose upstream died is replaced transparently.
    pub async fn get_or_create(&self, test_id: &str) -> Result<Arc<Session>, RegistryError> {
        if test_id.is_empty() {
            return Err(RegistryError::EmptyTestId);
        }
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(test_id) {
                if !session.is_poisoned() {
                    session.touch();
                    return Ok(session.clone());
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(test_id) {
            if !session.is_poisoned() {
                session.touch();
                return Ok(session.clone());
            }
            let dead = sessions.remove(test_id);
            drop_session(dead).await;
            warn!(test_id, "replacing session with dead upstream");
        }

        let session = self.open_session(test_id).await?;
        sessions.insert(test_id.to_string(), session.clone());
        info!(test_id, "session created");
        Ok(session)
    }

    async fn open_session(&self, test_id: &str) -> Result<Arc<Session>, RegistryError> {
        let config = UpstreamConfig {
            host: self.settings.postgres_host.clone(),
            port: self.settings.postgres_port,
            database: self.settings.postgres_database.clone(),
            user: self.settings.postgres_user.clone(),
            password: self.settings.postgres_password.clone(),
            application_name: upstream_application_name(test_id),
            session_timeout: self.settings.session_timeout,
        };
        let mut upstream = UpstreamConnection::connect(&config).await?;
        upstream.begin_base_tx().await?;
        let session = Session::new(test_id, upstream);
        session.spawn_keepalive(self.settings.keepalive_interval);
        Ok(session)
    }

    pub async fn get(&self, test_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(test_id).cloned()
    }

    /// Rolls back the session's base transaction, opens a fresh one, and
    /// resets the savepoint state. The whole sequence runs under the
    /// session's advisory lock so concurrent resets of the same test id
    /// serialize across proxies sharing the database.
    pub async fn rollback_base(&self, test_id: &str) -> Result<(), RegistryError> {
        let session = self
            .get(test_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(test_id.to_string()))?;
        let key = session.advisory_lock_key();
        let mut core = session.lock().await;
        core.upstream.acquire_advisory_lock(key).await.map_err(|err| {
            if err.is_fatal() {
                session.mark_poisoned();
            }
            err
        })?;
        let result = core.upstream.rollback_and_restart_base_tx().await;
        if let Err(err) = core.upstream.release_advisory_lock(key).await {
            warn!(test_id, error = %err, "failed to release advisory lock");
        }
        match result {
            Ok(()) => {
                core.savepoint_level = 0;
                core.claim = None;
                core.history.clear_last();
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    session.mark_poisoned();
                }
                Err(err.into())
            }
        }
    }

    /// Destroys a session: rolls back the base transaction (an already
    /// dead connection counts as success), closes the upstream, removes
    /// the entry.
    pub async fn destroy(&self, test_id: &str) -> Result<(), RegistryError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(test_id)
                .ok_or_else(|| RegistryError::NotFound(test_id.to_string()))?
        };
        close_session(&session).await;
        info!(test_id, "session destroyed");
        Ok(())
    }

    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            close_session(&session).await;
        }
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.test_id().cmp(b.test_id()));
        sessions
    }

    /// Removes sessions idle past the configured window. Returns how many
    /// were cleaned.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > self.settings.idle_timeout)
                .map(|(test_id, _)| test_id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|test_id| sessions.remove(&test_id))
                .collect()
        };
        let cleaned = expired.len();
        for session in expired {
            info!(test_id = %session.test_id(), "evicting idle session");
            close_session(&session).await;
        }
        cleaned
    }

    /// Evicts the session for a test id after a fatal upstream error; the
    /// next request creates a fresh session with a new base transaction.
    pub async fn evict(&self, test_id: &str) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(test_id)
        };
        if let Some(session) = session {
            session.mark_poisoned();
            close_session(&session).await;
            warn!(test_id, "session evicted after fatal upstream error");
        }
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::new();
        for session in self.all().await {
            let core = session.lock().await;
            statuses.push(SessionStatus {
                test_id: session.test_id().to_string(),
                active: core.upstream.has_base_tx(),
                level: core.savepoint_level,
                created_at: session.created_at().to_rfc3339(),
            });
        }
        statuses
    }

    /// Periodic eviction of idle sessions, scoped to the registry's
    /// lifetime through the weak handle.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                let cleaned = registry.cleanup_expired().await;
                if cleaned > 0 {
                    info!(cleaned, "cleaned up expired sessions");
                }
            }
        })
    }
}

async fn close_session(session: &Arc<Session>) {
    session.stop_keepalive();
    let mut core = session.lock().await;
    if let Err(err) = core.upstream.rollback_base_tx().await {
        // A dead connection has nothing left to roll back; that still
        // counts as a successful teardown.
        if !err.is_fatal() {
            warn!(test_id = %session.test_id(), error = %err, "rollback on destroy failed");
        }
    }
    core.upstream.close().await;
}

async fn drop_session(session: Option<Arc<Session>>) {
    if let Some(session) = session {
        close_session(&session).await;
    }
}
