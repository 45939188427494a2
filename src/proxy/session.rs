//! Per-test-id session state.
//!
//! The writer lock is the heart of the sharing model: a
//! `tokio::sync::Mutex` owns the upstream connection together with every
//! piece of mutable session state, so all SQL sent upstream and every
//! savepoint-level or claim mutation happens under one lock hold. N
//! client connections can then safely share one PostgreSQL connection,
//! which is strictly single-threaded at the protocol level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::proxy::history::QueryHistory;
use crate::proxy::statements::StatementRegistry;
use crate::upstream::UpstreamConnection;

/// Identifies one client connection within the proxy process. Used to
/// allow nested BEGIN from the claim holder while rejecting BEGIN from
/// any other connection.
pub type ConnId = u64;

/// Reserved prefix for the proxy's own savepoints. User savepoints must
/// not collide with it.
pub const SAVEPOINT_PREFIX: &str = "pgrollback_v_";

/// Deterministic savepoint name for a level; names are never stored.
pub fn savepoint_name(level: u32) -> String {
    format!("{SAVEPOINT_PREFIX}{level}")
}

/// Everything guarded by the session writer lock.
pub struct SessionCore {
    pub upstream: UpstreamConnection,
    /// Depth of the `pgrollback_v_*` savepoint stack. Level 0 means no
    /// open user transaction.
    pub savepoint_level: u32,
    /// The client connection currently holding the open user transaction.
    pub claim: Option<ConnId>,
    pub statements: StatementRegistry,
    pub history: QueryHistory,
}

impl SessionCore {
    pub fn new(upstream: UpstreamConnection) -> Self {
        Self {
            upstream,
            savepoint_level: 0,
            claim: None,
            statements: StatementRegistry::new(),
            history: QueryHistory::new(),
        }
    }

    pub fn current_savepoint_name(&self) -> String {
        savepoint_name(self.savepoint_level)
    }

    pub fn next_savepoint_name(&self) -> String {
        savepoint_name(self.savepoint_level + 1)
    }

    /// Records the claim for `conn`. Callers must have planned the BEGIN
    /// under this same lock hold, so the precondition still holds here.
    pub fn claim_open_transaction(&mut self, conn: ConnId) {
        self.claim = Some(conn);
    }

    /// Clears the claim if `conn` holds it; no-op otherwise.
    pub fn release_open_transaction(&mut self, conn: ConnId) {
        if self.claim == Some(conn) {
            self.claim = None;
        }
    }

    /// Call only after the backend confirmed the SAVEPOINT.
    pub fn increment_savepoint_level(&mut self) {
        self.savepoint_level += 1;
    }

    /// Call only after the backend confirmed the RELEASE or ROLLBACK TO.
    pub fn decrement_savepoint_level(&mut self) {
        if self.savepoint_level > 0 {
            self.savepoint_level -= 1;
        }
    }
}

pub struct Session {
    test_id: String,
    created_at: DateTime<Utc>,
    core: Mutex<SessionCore>,
    last_activity: StdMutex<Instant>,
    poisoned: AtomicBool,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(test_id: impl Into<String>, upstream: UpstreamConnection) -> Arc<Self> {
        Arc::new(Self {
            test_id: test_id.into(),
            created_at: Utc::now(),
            core: Mutex::new(SessionCore::new(upstream)),
            last_activity: StdMutex::new(Instant::now()),
            poisoned: AtomicBool::new(false),
            keepalive: StdMutex::new(None),
        })
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquires the writer lock and refreshes the activity timestamp.
    pub async fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.touch();
        self.core.lock().await
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Marks the upstream as dead; the registry replaces poisoned
    /// sessions on the next request for this test id.
    pub fn mark_poisoned(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Stable advisory-lock key for this test id.
    pub fn advisory_lock_key(&self) -> i64 {
        fnv1a64(format!("pgrollback_{}", self.test_id).as_bytes()) as i64
    }

    pub async fn has_open_user_transaction(&self) -> bool {
        self.core.lock().await.claim.is_some()
    }

    /// Runs a command atomically with respect to other sessions sharing
    /// the same advisory-lock key.
    pub async fn execute_with_lock(&self, sql: &str) -> Result<(), crate::upstream::UpstreamError> {
        let key = self.advisory_lock_key();
        self.touch();
        let mut core = self.core.lock().await;
        core.upstream.acquire_advisory_lock(key).await?;
        let result = core.upstream.exec(sql).await;
        if let Err(err) = core.upstream.release_advisory_lock(key).await {
            warn!(test_id = %self.test_id, error = %err, "failed to release advisory lock");
        }
        result.map(|_| ())
    }

    /// Starts the periodic upstream ping. The task holds only a weak
    /// reference, so it winds down when the session is destroyed.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Session> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                let mut core = session.core.lock().await;
                if let Err(err) = core.upstream.ping().await {
                    warn!(test_id = %session.test_id, error = %err, "keepalive ping failed");
                    if err.is_fatal() {
                        session.mark_poisoned();
                        return;
                    }
                } else {
                    debug!(test_id = %session.test_id, "keepalive ping");
                }
            }
        });
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn stop_keepalive(&self) {
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_names_are_deterministic() {
        assert_eq!(savepoint_name(1), "pgrollback_v_1");
        assert_eq!(savepoint_name(12), "pgrollback_v_12");
    }

    #[test]
    fn fnv1a64_matches_reference_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }
}
