//! The session registry.
//!
//! [`SessionManager`] is the single entry point for concurrent callers. The
//! registry map sits behind an `RwLock` and each session behind its own
//! `Mutex`, so operations on one session are serialized while different
//! sessions proceed in parallel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{AccessPolicy, Caller, Decision, Operation};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::graph::DependencyEdge;
use crate::id::{OptimizationId, SessionId, SubscriptionId, VariableId};
use crate::lease::{Lease, LivenessToken};
use crate::session::{
    BatchResult, BatchUpdate, NewVariable, Rule, Session, SessionInfo, SessionStats,
};
use crate::variable::{HistoryEntry, Metadata, OptimizationStatus, Variable, VariableSummary};
use crate::watch::WatchStream;
use crate::Value;

/// Expired ids remembered so later calls report `SessionExpired` rather
/// than `SessionNotFound`.
const TOMBSTONE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_cleaned_up: u64,
    pub sessions_expired: u64,
    pub locks_reclaimed: u64,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: Vec<SessionId>,
    pub reclaimed_locks: usize,
    pub pruned_subscriptions: usize,
}

type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug)]
pub struct SessionManager {
    config: StoreConfig,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    tombstones: Mutex<VecDeque<SessionId>>,
    created: AtomicU64,
    cleaned_up: AtomicU64,
    expired: AtomicU64,
    locks_reclaimed: AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn lock(session: &SessionHandle) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            cleaned_up: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            locks_reclaimed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // === Session lifecycle ===

    /// Create a session. `ttl` overrides the configured idle TTL.
    pub fn create_session(&self, id: impl Into<SessionId>, ttl: Option<Duration>) -> Result<SessionInfo> {
        let id = id.into();
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(Error::SessionExists(id));
        }
        if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
            return Err(Error::SessionLimit {
                max: self.config.max_sessions,
            });
        }

        let session = Session::new(id.clone(), &self.config, ttl, now);
        let info = session.info(now);
        sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        drop(sessions);

        self.forget_tombstone(&id);
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(session = %id, ttl_secs = ?info.ttl_secs, "session created");
        Ok(info)
    }

    /// Drop a session with its variables, locks and watch streams.
    pub fn cleanup_session(&self, id: &SessionId) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(_) => {
                self.cleaned_up.fetch_add(1, Ordering::Relaxed);
                info!(session = %id, "session cleaned up");
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = self
            .handles()
            .iter()
            .map(|handle| lock(handle).info(now))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn session_info(&self, id: &SessionId) -> Result<SessionInfo> {
        self.with_session(id, |session| Ok(session.info(Instant::now())))
    }

    pub fn session_stats(&self, id: &SessionId) -> Result<SessionStats> {
        self.with_session(id, |session| Ok(session.stats()))
    }

    /// Refresh a session's idle timer.
    pub fn touch(&self, id: &SessionId) -> Result<()> {
        self.with_session(id, |_| Ok(()))
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active_sessions: self
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            sessions_created: self.created.load(Ordering::Relaxed),
            sessions_cleaned_up: self.cleaned_up.load(Ordering::Relaxed),
            sessions_expired: self.expired.load(Ordering::Relaxed),
            locks_reclaimed: self.locks_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Run `f` on a live session under its lock, refreshing its idle timer.
    ///
    /// A session found idle past its TTL is reaped on the spot and reported
    /// as expired. Locks whose holders are gone are released before `f` runs.
    pub fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let handle = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| self.missing(id))?;

        let now = Instant::now();
        let mut session = lock(&handle);
        if session.is_expired(now) {
            drop(session);
            self.expire(id, &handle);
            return Err(Error::SessionExpired(id.clone()));
        }
        session.touch(now);
        let reclaimed = session.reclaim_locks(now).len();
        if reclaimed > 0 {
            self.locks_reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        f(&mut session)
    }

    // === Variables ===

    pub fn register_variable(&self, session: &SessionId, caller: &Caller, new: NewVariable) -> Result<VariableId> {
        self.with_session(session, |s| s.register(caller, new))
    }

    pub fn get_variable(&self, session: &SessionId, caller: &Caller, identifier: &str) -> Result<Variable> {
        self.with_session(session, |s| s.get(caller, identifier))
    }

    pub fn get_variables<S: AsRef<str>>(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifiers: &[S],
    ) -> Result<BTreeMap<String, Variable>> {
        self.with_session(session, |s| Ok(s.get_many(caller, identifiers)))
    }

    pub fn set_variable(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        value: Value,
        metadata: Metadata,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.with_session(session, |s| s.set(caller, identifier, value, metadata, expected_version))
    }

    pub fn set_variables(
        &self,
        session: &SessionId,
        caller: &Caller,
        updates: BTreeMap<String, BatchUpdate>,
        metadata: Metadata,
        atomic: bool,
    ) -> Result<BatchResult> {
        self.with_session(session, |s| Ok(s.set_many(caller, updates, metadata, atomic)))
    }

    pub fn list_variables(&self, session: &SessionId) -> Result<Vec<VariableSummary>> {
        self.with_session(session, |s| Ok(s.list_variables()))
    }

    pub fn delete_variable(&self, session: &SessionId, caller: &Caller, identifier: &str) -> Result<Variable> {
        self.with_session(session, |s| s.delete_variable(caller, identifier))
    }

    pub fn variable_history(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.with_session(session, |s| s.history(caller, identifier, limit, offset))
    }

    pub fn rollback_variable(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        target_version: u64,
    ) -> Result<u64> {
        self.with_session(session, |s| s.rollback(caller, identifier, target_version))
    }

    // === Rules and dependencies ===

    pub fn add_rule(&self, session: &SessionId, name: &str, rule: Rule) -> Result<()> {
        self.with_session(session, |s| {
            s.add_rule(name, rule);
            Ok(())
        })
    }

    pub fn remove_rule(&self, session: &SessionId, name: &str) -> Result<bool> {
        self.with_session(session, |s| Ok(s.remove_rule(name)))
    }

    pub fn add_dependency(
        &self,
        session: &SessionId,
        caller: &Caller,
        from: &str,
        to: &str,
        kind: Option<&str>,
    ) -> Result<()> {
        self.with_session(session, |s| s.add_dependency(caller, from, to, kind))
    }

    pub fn remove_dependency(&self, session: &SessionId, caller: &Caller, from: &str, to: &str) -> Result<bool> {
        self.with_session(session, |s| s.remove_dependency(caller, from, to))
    }

    pub fn dependents(&self, session: &SessionId, caller: &Caller, identifier: &str) -> Result<Vec<VariableSummary>> {
        self.with_session(session, |s| s.dependents(caller, identifier))
    }

    pub fn dependencies(&self, session: &SessionId, caller: &Caller, identifier: &str) -> Result<Vec<VariableSummary>> {
        self.with_session(session, |s| s.dependencies(caller, identifier))
    }

    pub fn dependency_edges(&self, session: &SessionId) -> Result<Vec<DependencyEdge>> {
        self.with_session(session, |s| Ok(s.dependency_edges()))
    }

    // === Optimization ===

    /// Lock a variable for `holder`. With a `liveness` token the lock is
    /// released once every clone of the token is dropped; without one it
    /// lives on heartbeats alone.
    pub fn start_optimization(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        holder: &str,
        liveness: Option<&LivenessToken>,
    ) -> Result<OptimizationId> {
        let now = Instant::now();
        let lease = match liveness {
            Some(token) => token.lease(now),
            None => Lease::heartbeat(now),
        };
        self.with_session(session, |s| s.start_optimization(caller, identifier, holder, lease, now))
    }

    pub fn stop_optimization(&self, session: &SessionId, caller: &Caller, identifier: &str, holder: &str) -> Result<()> {
        self.with_session(session, |s| s.stop_optimization(caller, identifier, holder))
    }

    pub fn heartbeat_optimization(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        holder: &str,
    ) -> Result<()> {
        self.with_session(session, |s| {
            s.heartbeat_optimization(caller, identifier, holder, Instant::now())
        })
    }

    pub fn optimization_status(&self, session: &SessionId, caller: &Caller, identifier: &str) -> Result<OptimizationStatus> {
        self.with_session(session, |s| s.optimization_status(caller, identifier, Instant::now()))
    }

    // === Access ===

    pub fn set_permissions(&self, session: &SessionId, identifier: &str, policy: AccessPolicy) -> Result<()> {
        self.with_session(session, |s| s.set_permissions(identifier, policy))
    }

    pub fn check_access(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifier: &str,
        operation: Operation,
    ) -> Result<Decision> {
        self.with_session(session, |s| s.check_access(caller, identifier, operation))
    }

    // === Watch ===

    pub fn watch_variables<S: AsRef<str>>(
        &self,
        session: &SessionId,
        caller: &Caller,
        identifiers: &[S],
        include_initial: bool,
    ) -> Result<WatchStream> {
        self.with_session(session, |s| s.watch(caller, identifiers, include_initial))
    }

    /// Returns whether the subscription existed.
    pub fn unwatch(&self, session: &SessionId, subscription: SubscriptionId) -> Result<bool> {
        self.with_session(session, |s| Ok(s.unwatch(subscription)))
    }

    // === Sweeping ===

    /// Reap idle sessions and release dead locks in the rest.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();

        for (id, handle) in handles {
            let mut session = lock(&handle);
            if session.is_expired(now) {
                drop(session);
                self.expire(&id, &handle);
                report.expired_sessions.push(id);
                continue;
            }
            let outcome = session.sweep(now);
            report.reclaimed_locks += outcome.reclaimed_locks.len();
            report.pruned_subscriptions += outcome.pruned_subscriptions;
        }

        self.locks_reclaimed
            .fetch_add(report.reclaimed_locks as u64, Ordering::Relaxed);
        if !report.expired_sessions.is_empty() || report.reclaimed_locks > 0 {
            debug!(
                expired = report.expired_sessions.len(),
                reclaimed_locks = report.reclaimed_locks,
                pruned = report.pruned_subscriptions,
                "sweep"
            );
        }
        report
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Sweep every `sweep_interval` until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep();
            }
            debug!("sweeper stopped");
        })
    }

    // === Internals ===

    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove `handle` if it is still the registered session for `id`.
    fn expire(&self, id: &SessionId, handle: &SessionHandle) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let current = sessions.get(id).is_some_and(|h| Arc::ptr_eq(h, handle));
        if !current {
            return;
        }
        sessions.remove(id);
        drop(sessions);

        let mut tombstones = self.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        if tombstones.len() >= TOMBSTONE_LIMIT {
            tombstones.pop_front();
        }
        tombstones.push_back(id.clone());
        self.expired.fetch_add(1, Ordering::Relaxed);
        warn!(session = %id, "session expired");
    }

    fn forget_tombstone(&self, id: &SessionId) {
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| t != id);
    }

    fn missing(&self, id: &SessionId) -> Error {
        let expired = self
            .tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id);
        if expired {
            Error::SessionExpired(id.clone())
        } else {
            Error::SessionNotFound(id.clone())
        }
    }
}
