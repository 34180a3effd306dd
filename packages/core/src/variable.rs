//! The versioned record of a single variable.
//!
//! [`VariableState`] is the only place a variable's value, version,
//! metadata, history and lock state change. Writes are split into
//! [`VariableState::prepare`] (pure validation) and
//! [`VariableState::commit`] (infallible mutation) so batches can validate
//! every update before applying any.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::{AccessPolicy, AccessRule};
use crate::error::{Error, Result};
use crate::id::{OptimizationId, VariableId};
use crate::lease::Lease;
use crate::types::{Constraints, VarType};
use crate::Value;

/// Free-form string metadata. Merged on every update, never replaced.
pub type Metadata = BTreeMap<String, String>;

/// A prior state of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub updated_by: String,
    pub metadata: Metadata,
}

/// Public view of a variable's optimization lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStatus {
    pub locked: bool,
    pub holder_id: Option<String>,
    pub optimization_id: Option<OptimizationId>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of a variable as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VariableId,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub value: Value,
    pub constraints: Constraints,
    pub metadata: Metadata,
    pub version: u64,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub optimization: OptimizationStatus,
    pub access_rules: Vec<AccessRule>,
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub id: VariableId,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub version: u64,
    pub locked: bool,
}

/// What a commit changed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub old_value: Value,
    pub new_value: Value,
    pub version: u64,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct LockState {
    holder_id: String,
    optimization_id: OptimizationId,
    started_at: DateTime<Utc>,
    lease: Lease,
}

#[derive(Debug)]
pub(crate) struct VariableState {
    id: VariableId,
    name: String,
    var_type: VarType,
    value: Value,
    constraints: Constraints,
    metadata: Metadata,
    version: u64,
    updated_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    access: AccessPolicy,
    lock: Option<LockState>,
}

impl VariableState {
    /// Validate the constraint map and initial value, producing version 0.
    pub fn new(
        name: String,
        var_type: VarType,
        initial: Value,
        constraints: Constraints,
        metadata: Metadata,
        created_by: &str,
        history_limit: usize,
    ) -> Result<Self> {
        var_type.check_spec(&constraints)?;
        let value = var_type.validate(initial, &constraints)?;
        let now = Utc::now();
        Ok(Self {
            id: VariableId::generate(),
            name,
            var_type,
            value,
            constraints,
            metadata,
            version: 0,
            updated_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            history: VecDeque::new(),
            history_limit,
            access: AccessPolicy::default(),
            lock: None,
        })
    }

    pub fn id(&self) -> &VariableId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    pub fn set_access(&mut self, policy: AccessPolicy) {
        self.access = policy;
    }

    pub fn snapshot(&self) -> Variable {
        Variable {
            id: self.id.clone(),
            name: self.name.clone(),
            var_type: self.var_type,
            value: self.value.clone(),
            constraints: self.constraints.clone(),
            metadata: self.metadata.clone(),
            version: self.version,
            updated_by: self.updated_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            optimization: self.optimization_status(),
            access_rules: self.access.rules().to_vec(),
        }
    }

    pub fn summary(&self) -> VariableSummary {
        VariableSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            var_type: self.var_type,
            version: self.version,
            locked: self.lock.is_some(),
        }
    }

    /// Check the optimistic version and validate `raw` without mutating.
    pub fn prepare(&self, raw: Value, expected_version: Option<u64>) -> Result<Value> {
        if let Some(expected) = expected_version {
            if expected != self.version {
                return Err(Error::VersionConflict {
                    expected,
                    actual: self.version,
                });
            }
        }
        self.var_type.validate(raw, &self.constraints)
    }

    /// Apply a prepared value: archive the current state, merge metadata and
    /// bump the version by exactly one.
    pub fn commit(&mut self, value: Value, metadata: Metadata, updated_by: &str) -> Change {
        let now = Utc::now();
        if self.history_limit > 0 {
            while self.history.len() >= self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(HistoryEntry {
                version: self.version,
                value: self.value.clone(),
                timestamp: self.updated_at,
                updated_by: self.updated_by.clone(),
                metadata: self.metadata.clone(),
            });
        }

        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        let old_value = std::mem::replace(&mut self.value, value);
        self.version += 1;
        self.updated_at = now;
        self.updated_by = updated_by.to_string();

        Change {
            old_value,
            new_value: self.value.clone(),
            version: self.version,
            metadata,
            timestamp: now,
        }
    }

    /// Prior states, newest first.
    pub fn history(&self, limit: Option<usize>, offset: usize) -> Vec<HistoryEntry> {
        self.history
            .iter()
            .rev()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn history_value(&self, version: u64) -> Result<Value> {
        self.history
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| entry.value.clone())
            .ok_or(Error::VersionNotFound { version })
    }

    // === Optimization lock ===

    pub fn optimization_status(&self) -> OptimizationStatus {
        match &self.lock {
            Some(lock) => OptimizationStatus {
                locked: true,
                holder_id: Some(lock.holder_id.clone()),
                optimization_id: Some(lock.optimization_id),
                started_at: Some(lock.started_at),
            },
            None => OptimizationStatus::default(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn start_optimization(&mut self, holder_id: &str, lease: Lease) -> Result<OptimizationId> {
        if let Some(lock) = &self.lock {
            return Err(Error::AlreadyOptimizing {
                holder: lock.holder_id.clone(),
            });
        }
        let optimization_id = OptimizationId::new();
        self.lock = Some(LockState {
            holder_id: holder_id.to_string(),
            optimization_id,
            started_at: Utc::now(),
            lease,
        });
        Ok(optimization_id)
    }

    pub fn stop_optimization(&mut self, holder_id: &str) -> Result<()> {
        match &self.lock {
            Some(lock) if lock.holder_id == holder_id => {
                self.lock = None;
                Ok(())
            }
            _ => Err(Error::NotOptimizing),
        }
    }

    pub fn heartbeat(&mut self, holder_id: &str, now: Instant) -> Result<()> {
        match &mut self.lock {
            Some(lock) if lock.holder_id == holder_id => {
                lock.lease.renew(now);
                Ok(())
            }
            _ => Err(Error::NotOptimizing),
        }
    }

    /// Release the lock if its holder is gone. Returns the released holder.
    pub fn reclaim_lock(&mut self, now: Instant, timeout: Option<Duration>) -> Option<String> {
        let expired = self
            .lock
            .as_ref()
            .is_some_and(|lock| lock.lease.is_expired(now, timeout));
        if expired {
            self.lock.take().map(|lock| lock.holder_id)
        } else {
            None
        }
    }
}
