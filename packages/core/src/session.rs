//! A session: one isolated namespace of variables.
//!
//! A [`Session`] is plain single-threaded state. The
//! [`SessionManager`](crate::manager::SessionManager) wraps each one in a
//! mutex, which is what serializes operations on the same session.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::{AccessPolicy, Caller, Decision, Operation};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::graph::{DependencyEdge, DependencyGraph, DEFAULT_EDGE_KIND};
use crate::id::{OptimizationId, SessionId, SubscriptionId, VariableId};
use crate::lease::Lease;
use crate::types::{Constraints, VarType};
use crate::variable::{
    HistoryEntry, Metadata, OptimizationStatus, Variable, VariableState, VariableSummary,
};
use crate::watch::{ChangeCause, UpdateEvent, WatchEvent, WatchHub, WatchStream};
use crate::Value;

/// A cross-variable rule. Receives the session's values as they would be
/// after the pending write and returns a reason on failure.
pub type Rule = Arc<dyn Fn(&SessionView) -> std::result::Result<(), String> + Send + Sync>;

/// Name to value view handed to [`Rule`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    values: BTreeMap<String, Value>,
}

impl SessionView {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Everything needed to register a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub value: Value,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewVariable {
    pub fn new(name: impl Into<String>, var_type: VarType, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            var_type,
            value: value.into(),
            constraints: Constraints::new(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn constraint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One entry of a batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdate {
    pub value: Value,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl<T: Into<Value>> From<T> for BatchUpdate {
    fn from(value: T) -> Self {
        Self {
            value: value.into(),
            expected_version: None,
        }
    }
}

/// Outcome of a batch write, keyed by the identifiers as supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// New version per applied update.
    pub applied: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, Error>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a single error naming every rejected key.
    pub fn into_result(self) -> Result<BTreeMap<String, u64>> {
        if self.errors.is_empty() {
            Ok(self.applied)
        } else {
            Err(Error::PartialFailure {
                failed: self.errors.into_keys().collect(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub ttl_secs: Option<u64>,
    pub variables: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub variables: usize,
    pub dependencies: usize,
    pub reads: u64,
    pub writes: u64,
    pub failed_writes: u64,
    pub rollbacks: u64,
    pub active_subscriptions: usize,
    pub active_locks: usize,
}

/// What a sweep released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// `(variable name, holder)` per force-released lock.
    pub reclaimed_locks: Vec<(String, String)>,
    pub pruned_subscriptions: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    reads: u64,
    writes: u64,
    failed_writes: u64,
    rollbacks: u64,
}

pub struct Session {
    id: SessionId,
    variables: BTreeMap<VariableId, VariableState>,
    names: BTreeMap<String, VariableId>,
    graph: DependencyGraph,
    rules: BTreeMap<String, Rule>,
    hub: WatchHub,
    created_at: DateTime<Utc>,
    last_accessed: Instant,
    ttl: Option<Duration>,
    history_limit: usize,
    lock_timeout: Option<Duration>,
    counters: Counters,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("variables", &self.variables.len())
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Session {
    /// `ttl` overrides the configured idle TTL when given.
    pub fn new(id: SessionId, config: &StoreConfig, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            id,
            variables: BTreeMap::new(),
            names: BTreeMap::new(),
            graph: DependencyGraph::new(),
            rules: BTreeMap::new(),
            hub: WatchHub::new(config.watch_buffer),
            created_at: Utc::now(),
            last_accessed: now,
            ttl: ttl.or_else(|| config.session_ttl()),
            history_limit: config.history_limit,
            lock_timeout: config.lock_timeout(),
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    // === Lifecycle ===

    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.last_accessed) > ttl)
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            idle_secs: now.saturating_duration_since(self.last_accessed).as_secs(),
            ttl_secs: self.ttl.map(|ttl| ttl.as_secs()),
            variables: self.variables.len(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            variables: self.variables.len(),
            dependencies: self.graph.edge_count(),
            reads: self.counters.reads,
            writes: self.counters.writes,
            failed_writes: self.counters.failed_writes,
            rollbacks: self.counters.rollbacks,
            active_subscriptions: self.hub.len(),
            active_locks: self.variables.values().filter(|v| v.is_locked()).count(),
        }
    }

    /// Release locks held by dead holders and forget closed subscribers.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        SweepOutcome {
            reclaimed_locks: self.reclaim_locks(now),
            pruned_subscriptions: self.hub.prune(),
        }
    }

    /// Release every lock whose holder is gone, as `(variable, holder)` pairs.
    pub fn reclaim_locks(&mut self, now: Instant) -> Vec<(String, String)> {
        let timeout = self.lock_timeout;
        let mut reclaimed = Vec::new();
        for var in self.variables.values_mut() {
            if let Some(holder) = var.reclaim_lock(now, timeout) {
                warn!(session = %self.id, variable = %var.name(), holder = %holder, "reclaimed optimization lock");
                reclaimed.push((var.name().to_string(), holder));
            }
        }
        reclaimed
    }

    // === Lookup ===

    /// Resolve an id or a name. Ids win when both match.
    fn resolve(&self, identifier: &str) -> Result<VariableId> {
        if let Some((id, _)) = self.variables.get_key_value(identifier) {
            return Ok(id.clone());
        }
        self.names
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::VariableNotFound(identifier.to_string()))
    }

    fn var(&self, id: &VariableId) -> Result<&VariableState> {
        self.variables
            .get(id)
            .ok_or_else(|| Error::VariableNotFound(id.to_string()))
    }

    fn var_mut(&mut self, id: &VariableId) -> Result<&mut VariableState> {
        self.variables
            .get_mut(id)
            .ok_or_else(|| Error::VariableNotFound(id.to_string()))
    }

    fn lookup(&self, identifier: &str) -> Result<&VariableState> {
        let id = self.resolve(identifier)?;
        self.var(&id)
    }

    // === Variables ===

    pub fn register(&mut self, caller: &Caller, new: NewVariable) -> Result<VariableId> {
        if self.names.contains_key(&new.name) {
            return Err(Error::DuplicateName(new.name));
        }
        let state = VariableState::new(
            new.name,
            new.var_type,
            new.value,
            new.constraints,
            new.metadata,
            &caller.id,
            self.history_limit,
        )?;
        let id = state.id().clone();
        info!(session = %self.id, variable = %state.name(), id = %id, var_type = %new.var_type, "registered variable");
        self.names.insert(state.name().to_string(), id.clone());
        self.variables.insert(id.clone(), state);
        Ok(id)
    }

    pub fn get(&mut self, caller: &Caller, identifier: &str) -> Result<Variable> {
        let var = self.lookup(identifier)?;
        var.access().enforce(caller, Operation::Read)?;
        let snapshot = var.snapshot();
        self.counters.reads += 1;
        Ok(snapshot)
    }

    /// Fetch several variables. Identifiers that do not resolve, or that the
    /// caller may not read, are left out.
    pub fn get_many<S: AsRef<str>>(
        &mut self,
        caller: &Caller,
        identifiers: &[S],
    ) -> BTreeMap<String, Variable> {
        let found: BTreeMap<String, Variable> = identifiers
            .iter()
            .filter_map(|identifier| {
                let identifier = identifier.as_ref();
                let var = self.lookup(identifier).ok()?;
                var.access().enforce(caller, Operation::Read).ok()?;
                Some((identifier.to_string(), var.snapshot()))
            })
            .collect();
        self.counters.reads += found.len() as u64;
        found
    }

    pub fn list_variables(&self) -> Vec<VariableSummary> {
        self.names
            .values()
            .filter_map(|id| self.variables.get(id))
            .map(VariableState::summary)
            .collect()
    }

    pub fn set(
        &mut self,
        caller: &Caller,
        identifier: &str,
        value: Value,
        metadata: Metadata,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let outcome = self.try_set(caller, identifier, value, metadata, expected_version, ChangeCause::Set);
        if outcome.is_err() {
            self.counters.failed_writes += 1;
        }
        outcome
    }

    fn try_set(
        &mut self,
        caller: &Caller,
        identifier: &str,
        value: Value,
        metadata: Metadata,
        expected_version: Option<u64>,
        cause: ChangeCause,
    ) -> Result<u64> {
        let (id, value) = self.prepare_update(caller, identifier, value, expected_version)?;
        self.check_rules(&[(id.clone(), value.clone())])?;
        self.commit(&id, value, metadata, caller, cause)
    }

    fn prepare_update(
        &self,
        caller: &Caller,
        identifier: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<(VariableId, Value)> {
        let id = self.resolve(identifier)?;
        let var = self.var(&id)?;
        var.access().enforce(caller, Operation::Write)?;
        let value = var.prepare(value, expected_version)?;
        Ok((id, value))
    }

    /// Apply several writes.
    ///
    /// Atomic batches validate every update (and the session's rules against
    /// all of them together) before applying any; one failure rejects the
    /// whole batch. Non-atomic batches apply each update independently.
    pub fn set_many(
        &mut self,
        caller: &Caller,
        updates: BTreeMap<String, BatchUpdate>,
        metadata: Metadata,
        atomic: bool,
    ) -> BatchResult {
        let result = if atomic {
            self.set_many_atomic(caller, updates, metadata)
        } else {
            let mut result = BatchResult::default();
            for (key, update) in updates {
                match self.try_set(
                    caller,
                    &key,
                    update.value,
                    metadata.clone(),
                    update.expected_version,
                    ChangeCause::Batch,
                ) {
                    Ok(version) => {
                        result.applied.insert(key, version);
                    }
                    Err(err) => {
                        result.errors.insert(key, err);
                    }
                }
            }
            result
        };
        self.counters.failed_writes += result.errors.len() as u64;
        debug!(
            session = %self.id,
            atomic,
            applied = result.applied.len(),
            rejected = result.errors.len(),
            "batch write"
        );
        result
    }

    fn set_many_atomic(
        &mut self,
        caller: &Caller,
        updates: BTreeMap<String, BatchUpdate>,
        metadata: Metadata,
    ) -> BatchResult {
        let mut result = BatchResult::default();
        let mut targets: BTreeMap<VariableId, String> = BTreeMap::new();
        let mut prepared = Vec::with_capacity(updates.len());

        for (key, update) in updates {
            match self.prepare_update(caller, &key, update.value, update.expected_version) {
                Ok((id, value)) => {
                    if let Some(first) = targets.get(&id) {
                        let message = format!("'{}' and '{}' name the same variable", first, key);
                        result.errors.insert(key, Error::violation(message));
                        continue;
                    }
                    targets.insert(id.clone(), key.clone());
                    prepared.push((key, id, value));
                }
                Err(err) => {
                    result.errors.insert(key, err);
                }
            }
        }

        if result.errors.is_empty() {
            let pending: Vec<(VariableId, Value)> = prepared
                .iter()
                .map(|(_, id, value)| (id.clone(), value.clone()))
                .collect();
            if let Err(err) = self.check_rules(&pending) {
                for (key, _, _) in &prepared {
                    result.errors.insert(key.clone(), err.clone());
                }
            }
        }
        if !result.errors.is_empty() {
            return result;
        }

        for (key, id, value) in prepared {
            match self.commit(&id, value, metadata.clone(), caller, ChangeCause::Batch) {
                Ok(version) => {
                    result.applied.insert(key, version);
                }
                Err(err) => {
                    result.errors.insert(key, err);
                }
            }
        }
        result
    }

    /// Restore a historical value as a new version.
    pub fn rollback(&mut self, caller: &Caller, identifier: &str, target_version: u64) -> Result<u64> {
        let outcome = self.try_rollback(caller, identifier, target_version);
        match outcome {
            Ok(_) => self.counters.rollbacks += 1,
            Err(_) => self.counters.failed_writes += 1,
        }
        outcome
    }

    fn try_rollback(&mut self, caller: &Caller, identifier: &str, target_version: u64) -> Result<u64> {
        let id = self.resolve(identifier)?;
        let var = self.var(&id)?;
        var.access().enforce(caller, Operation::Write)?;
        let value = var.history_value(target_version)?;
        let value = var.prepare(value, None)?;
        self.check_rules(&[(id.clone(), value.clone())])?;
        let mut metadata = Metadata::new();
        metadata.insert("rollback_from".into(), var.version().to_string());
        metadata.insert("rollback_to".into(), target_version.to_string());
        self.commit(&id, value, metadata, caller, ChangeCause::Rollback { target_version })
    }

    pub fn history(
        &self,
        caller: &Caller,
        identifier: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let var = self.lookup(identifier)?;
        var.access().enforce(caller, Operation::Read)?;
        Ok(var.history(limit, offset))
    }

    /// Remove a variable with its name, its dependency edges and its
    /// watchers. Returns its final state.
    pub fn delete_variable(&mut self, caller: &Caller, identifier: &str) -> Result<Variable> {
        let id = self.resolve(identifier)?;
        self.var(&id)?.access().enforce(caller, Operation::Write)?;
        let state = self
            .variables
            .remove(&id)
            .ok_or_else(|| Error::VariableNotFound(identifier.to_string()))?;

        self.names.remove(state.name());
        self.graph.remove_node(&id);
        let event = WatchEvent::Deleted {
            variable_id: id.clone(),
            name: state.name().to_string(),
            timestamp: Utc::now(),
        };
        self.hub.remove_variable(&id, &event);
        info!(session = %self.id, variable = %state.name(), "deleted variable");
        Ok(state.snapshot())
    }

    /// Archive, apply and announce a prepared value.
    fn commit(
        &mut self,
        id: &VariableId,
        value: Value,
        metadata: Metadata,
        caller: &Caller,
        cause: ChangeCause,
    ) -> Result<u64> {
        let var = self.var_mut(id)?;
        let change = var.commit(value, metadata, &caller.id);
        let name = var.name().to_string();
        self.counters.writes += 1;
        debug!(session = %self.id, variable = %name, version = change.version, source = %caller.id, "committed");

        let dependency_version = change.version;
        let timestamp = change.timestamp;
        let event = WatchEvent::Updated(UpdateEvent {
            variable_id: id.clone(),
            name: name.clone(),
            old_value: change.old_value,
            new_value: change.new_value,
            version: change.version,
            metadata: change.metadata,
            source: caller.id.clone(),
            cause,
            timestamp,
        });
        self.hub.publish(id, &event);

        for dependent in self.graph.dependents(id) {
            let Some(dependent_name) = self.variables.get(&dependent).map(|v| v.name().to_string())
            else {
                continue;
            };
            let event = WatchEvent::DependencyChanged {
                variable_id: dependent.clone(),
                name: dependent_name,
                dependency_id: id.clone(),
                dependency_name: name.clone(),
                dependency_version,
                timestamp,
            };
            self.hub.publish(&dependent, &event);
        }
        Ok(dependency_version)
    }

    // === Cross-variable rules ===

    /// Install a rule, replacing any rule with the same name.
    pub fn add_rule(&mut self, name: impl Into<String>, rule: Rule) {
        let name = name.into();
        debug!(session = %self.id, rule = %name, "added rule");
        self.rules.insert(name, rule);
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        self.rules.remove(name).is_some()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    fn check_rules(&self, pending: &[(VariableId, Value)]) -> Result<()> {
        if self.rules.is_empty() {
            return Ok(());
        }
        let mut values: BTreeMap<String, Value> = self
            .variables
            .values()
            .map(|var| (var.name().to_string(), var.value().clone()))
            .collect();
        for (id, value) in pending {
            if let Some(var) = self.variables.get(id) {
                values.insert(var.name().to_string(), value.clone());
            }
        }
        let view = SessionView { values };
        for (name, rule) in &self.rules {
            rule(&view).map_err(|reason| Error::violation(format!("rule '{}' failed: {}", name, reason)))?;
        }
        Ok(())
    }

    // === Dependencies ===

    /// Record that `from` depends on `to`.
    pub fn add_dependency(
        &mut self,
        caller: &Caller,
        from: &str,
        to: &str,
        kind: Option<&str>,
    ) -> Result<()> {
        let from_id = self.resolve(from)?;
        let to_id = self.resolve(to)?;
        self.var(&from_id)?.access().enforce(caller, Operation::Write)?;
        self.graph
            .add_edge(&from_id, &to_id, kind.unwrap_or(DEFAULT_EDGE_KIND))?;
        debug!(session = %self.id, from = %from, to = %to, "added dependency");
        Ok(())
    }

    /// Returns whether the edge existed.
    pub fn remove_dependency(&mut self, caller: &Caller, from: &str, to: &str) -> Result<bool> {
        let from_id = self.resolve(from)?;
        let to_id = self.resolve(to)?;
        self.var(&from_id)?.access().enforce(caller, Operation::Write)?;
        Ok(self.graph.remove_edge(&from_id, &to_id))
    }

    /// Variables that directly depend on `identifier`.
    pub fn dependents(&self, caller: &Caller, identifier: &str) -> Result<Vec<VariableSummary>> {
        let id = self.resolve(identifier)?;
        self.var(&id)?.access().enforce(caller, Operation::Read)?;
        Ok(self.summaries(self.graph.dependents(&id)))
    }

    /// Variables `identifier` directly depends on.
    pub fn dependencies(&self, caller: &Caller, identifier: &str) -> Result<Vec<VariableSummary>> {
        let id = self.resolve(identifier)?;
        self.var(&id)?.access().enforce(caller, Operation::Read)?;
        Ok(self.summaries(self.graph.dependencies(&id)))
    }

    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        self.graph.edges()
    }

    fn summaries(&self, ids: Vec<VariableId>) -> Vec<VariableSummary> {
        ids.iter()
            .filter_map(|id| self.variables.get(id))
            .map(VariableState::summary)
            .collect()
    }

    // === Optimization ===

    pub fn start_optimization(
        &mut self,
        caller: &Caller,
        identifier: &str,
        holder: &str,
        lease: Lease,
        now: Instant,
    ) -> Result<OptimizationId> {
        let session = self.id.clone();
        let timeout = self.lock_timeout;
        let id = self.resolve(identifier)?;
        let var = self.var_mut(&id)?;
        var.access().enforce(caller, Operation::Optimize)?;
        if let Some(previous) = var.reclaim_lock(now, timeout) {
            warn!(session = %session, variable = %var.name(), holder = %previous, "reclaimed optimization lock");
        }
        let optimization_id = var.start_optimization(holder, lease)?;
        info!(session = %session, variable = %var.name(), holder = %holder, "optimization started");
        Ok(optimization_id)
    }

    pub fn stop_optimization(&mut self, caller: &Caller, identifier: &str, holder: &str) -> Result<()> {
        let session = self.id.clone();
        let id = self.resolve(identifier)?;
        let var = self.var_mut(&id)?;
        var.access().enforce(caller, Operation::Optimize)?;
        var.stop_optimization(holder)?;
        info!(session = %session, variable = %var.name(), holder = %holder, "optimization stopped");
        Ok(())
    }

    pub fn heartbeat_optimization(
        &mut self,
        caller: &Caller,
        identifier: &str,
        holder: &str,
        now: Instant,
    ) -> Result<()> {
        let id = self.resolve(identifier)?;
        let var = self.var_mut(&id)?;
        var.access().enforce(caller, Operation::Optimize)?;
        var.heartbeat(holder, now)
    }

    /// Current lock state. A lock whose holder is gone reads as released.
    pub fn optimization_status(
        &mut self,
        caller: &Caller,
        identifier: &str,
        now: Instant,
    ) -> Result<OptimizationStatus> {
        let session = self.id.clone();
        let timeout = self.lock_timeout;
        let id = self.resolve(identifier)?;
        let var = self.var_mut(&id)?;
        var.access().enforce(caller, Operation::Read)?;
        if let Some(previous) = var.reclaim_lock(now, timeout) {
            warn!(session = %session, variable = %var.name(), holder = %previous, "reclaimed optimization lock");
        }
        Ok(var.optimization_status())
    }

    // === Access ===

    /// Replace a variable's rules. Authority comes from owning the session,
    /// so no per-variable check applies.
    pub fn set_permissions(&mut self, identifier: &str, policy: AccessPolicy) -> Result<()> {
        let session = self.id.clone();
        let id = self.resolve(identifier)?;
        let var = self.var_mut(&id)?;
        debug!(session = %session, variable = %var.name(), rules = policy.rules().len(), "replaced access rules");
        var.set_access(policy);
        Ok(())
    }

    pub fn check_access(&self, caller: &Caller, identifier: &str, operation: Operation) -> Result<Decision> {
        Ok(self.lookup(identifier)?.access().check(caller, operation))
    }

    // === Watch ===

    /// Subscribe to every identifier. All must resolve and be observable by
    /// `caller`, otherwise nothing is subscribed.
    pub fn watch<S: AsRef<str>>(
        &mut self,
        caller: &Caller,
        identifiers: &[S],
        include_initial: bool,
    ) -> Result<WatchStream> {
        let mut ids = BTreeSet::new();
        let mut initial = Vec::new();
        for identifier in identifiers {
            let id = self.resolve(identifier.as_ref())?;
            let var = self.var(&id)?;
            var.access().enforce(caller, Operation::Observe)?;
            if include_initial && !ids.contains(&id) {
                initial.push(WatchEvent::Initial {
                    variable_id: id.clone(),
                    name: var.name().to_string(),
                    value: var.value().clone(),
                    version: var.version(),
                    timestamp: Utc::now(),
                });
            }
            ids.insert(id);
        }

        let (subscription, rx) = self.hub.subscribe(ids, initial);
        debug!(session = %self.id, subscription = %subscription, watcher = %caller.id, "subscribed");
        Ok(WatchStream::new(subscription, self.id.clone(), rx))
    }

    pub fn unwatch(&mut self, subscription: SubscriptionId) -> bool {
        self.hub.unsubscribe(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessRule;
    use crate::lease::LivenessToken;

    fn session() -> Session {
        Session::new(
            SessionId::new("test"),
            &StoreConfig::default(),
            None,
            Instant::now(),
        )
    }

    fn caller() -> Caller {
        Caller::new("tester")
    }

    fn register_float(session: &mut Session, name: &str, value: f64) -> VariableId {
        session
            .register(
                &caller(),
                NewVariable::new(name, VarType::Float, value)
                    .constraint("min", 0.0)
                    .constraint("max", 2.0),
            )
            .unwrap()
    }

    fn set(session: &mut Session, name: &str, value: f64) -> Result<u64> {
        session.set(&caller(), name, Value::from(value), Metadata::new(), None)
    }

    #[test]
    fn resolves_by_id_and_name() {
        let mut s = session();
        let id = register_float(&mut s, "temperature", 0.7);
        let by_id = s.get(&caller(), id.as_str()).unwrap();
        let by_name = s.get(&caller(), "temperature").unwrap();
        assert_eq!(by_id, by_name);
        assert_eq!(
            s.get(&caller(), "nope").unwrap_err(),
            Error::VariableNotFound("nope".into())
        );
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut s = session();
        register_float(&mut s, "t", 0.5);
        let err = s
            .register(&caller(), NewVariable::new("t", VarType::Float, 0.1))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateName("t".into()));
        assert_eq!(s.list_variables().len(), 1);
    }

    #[test]
    fn rejected_set_counts_as_failed_write() {
        let mut s = session();
        register_float(&mut s, "t", 0.5);
        assert!(set(&mut s, "t", 5.0).is_err());
        assert_eq!(set(&mut s, "t", 1.5).unwrap(), 1);

        let stats = s.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.failed_writes, 1);
    }

    #[test]
    fn get_many_omits_missing_and_denied() {
        let mut s = session();
        register_float(&mut s, "a", 0.1);
        register_float(&mut s, "b", 0.2);
        s.set_permissions("b", AccessPolicy::new(vec![AccessRule::new("*", Vec::<Operation>::new())]))
            .unwrap();

        let found = s.get_many(&caller(), &["a", "b", "c"]);
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn atomic_batch_applies_nothing_on_failure() {
        let mut s = session();
        register_float(&mut s, "a", 0.1);
        register_float(&mut s, "b", 0.2);

        let updates = BTreeMap::from([
            ("a".to_string(), BatchUpdate::from(0.5)),
            ("b".to_string(), BatchUpdate::from(9.0)),
        ]);
        let result = s.set_many(&caller(), updates, Metadata::new(), true);
        assert!(result.applied.is_empty());
        assert!(matches!(
            result.errors.get("b"),
            Some(Error::ConstraintViolation { .. })
        ));
        assert_eq!(s.get(&caller(), "a").unwrap().version, 0);
    }

    #[test]
    fn atomic_batch_rejects_two_keys_for_one_variable() {
        let mut s = session();
        let id = register_float(&mut s, "a", 0.1);
        let updates = BTreeMap::from([
            ("a".to_string(), BatchUpdate::from(0.5)),
            (id.to_string(), BatchUpdate::from(0.6)),
        ]);
        let result = s.set_many(&caller(), updates, Metadata::new(), true);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(s.get(&caller(), "a").unwrap().version, 0);
    }

    #[test]
    fn non_atomic_batch_is_best_effort() {
        let mut s = session();
        register_float(&mut s, "a", 0.1);
        let updates = BTreeMap::from([
            ("a".to_string(), BatchUpdate::from(0.5)),
            ("missing".to_string(), BatchUpdate::from(0.5)),
        ]);
        let result = s.set_many(&caller(), updates, Metadata::new(), false);
        assert_eq!(result.applied.get("a"), Some(&1));
        assert_eq!(
            result.clone().into_result().unwrap_err(),
            Error::PartialFailure {
                failed: vec!["missing".into()]
            }
        );
    }

    #[test]
    fn rules_see_the_prospective_values() {
        let mut s = session();
        register_float(&mut s, "low", 0.2);
        register_float(&mut s, "high", 0.8);
        s.add_rule(
            "ordered",
            Arc::new(|view: &SessionView| match (view.f64("low"), view.f64("high")) {
                (Some(low), Some(high)) if low > high => Err(format!("{} > {}", low, high)),
                _ => Ok(()),
            }),
        );

        assert!(matches!(
            set(&mut s, "low", 0.9),
            Err(Error::ConstraintViolation { .. })
        ));
        assert_eq!(s.get(&caller(), "low").unwrap().version, 0);

        // Moving both together passes.
        let updates = BTreeMap::from([
            ("low".to_string(), BatchUpdate::from(0.9)),
            ("high".to_string(), BatchUpdate::from(1.0)),
        ]);
        assert!(s.set_many(&caller(), updates, Metadata::new(), true).is_success());

        assert!(s.remove_rule("ordered"));
        assert!(set(&mut s, "high", 0.0).is_ok());
    }

    #[test]
    fn rollback_records_its_target() {
        let mut s = session();
        register_float(&mut s, "t", 0.5);
        set(&mut s, "t", 1.0).unwrap();
        assert_eq!(s.rollback(&caller(), "t", 0).unwrap(), 2);

        let var = s.get(&caller(), "t").unwrap();
        assert_eq!(var.value, Value::from(0.5));
        assert_eq!(var.metadata.get("rollback_to").unwrap(), "0");
        assert_eq!(s.stats().rollbacks, 1);
        assert_eq!(
            s.rollback(&caller(), "t", 7).unwrap_err(),
            Error::VersionNotFound { version: 7 }
        );
    }

    #[test]
    fn dependents_hear_about_changes() {
        let mut s = session();
        register_float(&mut s, "base", 0.1);
        register_float(&mut s, "derived", 0.2);
        s.add_dependency(&caller(), "derived", "base", None).unwrap();

        let mut stream = s.watch(&caller(), &["derived"], false).unwrap();
        set(&mut s, "base", 0.3).unwrap();
        match stream.try_recv().unwrap() {
            WatchEvent::DependencyChanged {
                name,
                dependency_name,
                dependency_version,
                ..
            } => {
                assert_eq!(name, "derived");
                assert_eq!(dependency_name, "base");
                assert_eq!(dependency_version, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn delete_cleans_up_everything() {
        let mut s = session();
        register_float(&mut s, "base", 0.1);
        register_float(&mut s, "derived", 0.2);
        s.add_dependency(&caller(), "derived", "base", None).unwrap();
        let mut stream = s.watch(&caller(), &["base"], false).unwrap();

        s.delete_variable(&caller(), "base").unwrap();
        assert!(s.dependency_edges().is_empty());
        assert!(matches!(stream.try_recv().unwrap(), WatchEvent::Deleted { .. }));
        assert!(stream.try_recv().is_err());
        assert!(s.get(&caller(), "base").is_err());

        // The name is free again.
        register_float(&mut s, "base", 0.4);
    }

    #[test]
    fn watch_requires_observe_on_every_variable() {
        let mut s = session();
        register_float(&mut s, "a", 0.1);
        register_float(&mut s, "b", 0.2);
        s.set_permissions("b", AccessPolicy::new(vec![AccessRule::new("tester", [Operation::Read])]))
            .unwrap();
        assert!(matches!(
            s.watch(&caller(), &["a", "b"], true),
            Err(Error::AccessDenied { .. })
        ));
        assert_eq!(s.stats().active_subscriptions, 0);
    }

    #[test]
    fn sweep_reclaims_locks_of_dropped_streams() {
        let mut s = session();
        register_float(&mut s, "t", 0.5);
        let stream = s.watch(&caller(), &["t"], false).unwrap();
        let now = Instant::now();
        s.start_optimization(&caller(), "t", "opt", stream.liveness().lease(now), now)
            .unwrap();
        assert_eq!(s.stats().active_locks, 1);

        drop(stream);
        let outcome = s.sweep(now);
        assert_eq!(outcome.reclaimed_locks, vec![("t".to_string(), "opt".to_string())]);
        assert_eq!(outcome.pruned_subscriptions, 1);
        assert_eq!(s.stats().active_locks, 0);
    }

    #[test]
    fn a_dead_holder_does_not_block_a_new_one() {
        let mut s = session();
        register_float(&mut s, "t", 0.5);
        let now = Instant::now();
        let token = LivenessToken::new();
        s.start_optimization(&caller(), "t", "first", token.lease(now), now)
            .unwrap();
        assert!(s
            .start_optimization(&caller(), "t", "second", Lease::heartbeat(now), now)
            .is_err());

        drop(token);
        s.start_optimization(&caller(), "t", "second", Lease::heartbeat(now), now)
            .unwrap();
        let status = s.optimization_status(&caller(), "t", now).unwrap();
        assert_eq!(status.holder_id.as_deref(), Some("second"));
    }

    #[test]
    fn idle_sessions_expire() {
        let start = Instant::now();
        let mut s = Session::new(
            SessionId::new("idle"),
            &StoreConfig::default(),
            Some(Duration::from_secs(10)),
            start,
        );
        assert!(!s.is_expired(start + Duration::from_secs(10)));
        assert!(s.is_expired(start + Duration::from_secs(11)));
        s.touch(start + Duration::from_secs(5));
        assert!(!s.is_expired(start + Duration::from_secs(11)));
        assert_eq!(s.info(start + Duration::from_secs(7)).idle_secs, 2);
    }
}
