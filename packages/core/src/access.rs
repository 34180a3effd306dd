//! Per-variable access policy.
//!
//! Rules are evaluated in order; the first rule whose caller pattern matches
//! decides. A caller that matches no rule is allowed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Value;

/// Operations subject to access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Observe,
    Optimize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Observe => "observe",
            Operation::Optimize => "optimize",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "observe" => Ok(Operation::Observe),
            "optimize" => Ok(Operation::Optimize),
            other => Err(Error::invalid_constraint(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }
}

/// An already-identified caller plus the context its conditions are
/// evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: BTreeMap::new(),
        }
    }

    /// The store's own identity, used when no caller is supplied.
    pub fn system() -> Self {
        Self::new("system")
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A predicate over the caller's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// `context[key] == value`
    Equals { key: String, value: Value },
    /// `context[key]` is one of `values`
    OneOf { key: String, values: Vec<Value> },
    /// `context` has `key`
    Present { key: String },
}

impl Condition {
    pub fn holds(&self, context: &BTreeMap<String, Value>) -> bool {
        match self {
            Condition::Equals { key, value } => context.get(key) == Some(value),
            Condition::OneOf { key, values } => context
                .get(key)
                .is_some_and(|actual| values.contains(actual)),
            Condition::Present { key } => context.contains_key(key),
        }
    }
}

/// One ordered permission grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Exact caller id, `*`, or a `prefix*` wildcard.
    pub caller_pattern: String,
    pub permitted_ops: BTreeSet<Operation>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AccessRule {
    pub fn new(caller_pattern: impl Into<String>, ops: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            caller_pattern: caller_pattern.into(),
            permitted_ops: ops.into_iter().collect(),
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, caller_id: &str) -> bool {
        match self.caller_pattern.strip_suffix('*') {
            Some(prefix) => caller_id.starts_with(prefix),
            None => self.caller_pattern == caller_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

/// Ordered rule list attached to a variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessPolicy {
    rules: Vec<AccessRule>,
}

impl AccessPolicy {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[AccessRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn check(&self, caller: &Caller, operation: Operation) -> Decision {
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(&caller.id)) else {
            return Decision::Allow;
        };
        let allowed = rule.permitted_ops.contains(&operation)
            && rule
                .conditions
                .iter()
                .all(|condition| condition.holds(&caller.context));
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// `check`, as an error for the denied case.
    pub fn enforce(&self, caller: &Caller, operation: Operation) -> Result<(), Error> {
        match self.check(caller, operation) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Error::AccessDenied {
                caller: caller.id.clone(),
                operation,
            }),
        }
    }
}
