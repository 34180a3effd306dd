//! Wire format.
//!
//! One JSON object per line in each direction. Requests carry a
//! caller-chosen `id` and an `op`; every request gets exactly one
//! [`Response`] with the same `id`. Watch subscriptions additionally
//! produce [`WatchMessage`] lines until they end.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use varsync_core::{
    AccessRule, BatchResult, BatchUpdate, Caller, Constraints, Error, Metadata, Operation,
    SessionId, SubscriptionId, Value, WatchEvent,
};

/// Error kind for lines that are not valid requests.
pub const INVALID_REQUEST: &str = "invalid_request";

fn default_caller() -> Caller {
    Caller::system()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        session_id: SessionId,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    CleanupSession {
        session_id: SessionId,
    },
    ListSessions,
    SessionInfo {
        session_id: SessionId,
    },
    SessionStats {
        session_id: SessionId,
    },
    /// Reset the session's idle clock.
    TouchSession {
        session_id: SessionId,
    },
    /// Manager-wide counters.
    Stats,
    RegisterVariable {
        session_id: SessionId,
        name: String,
        #[serde(rename = "type")]
        var_type: String,
        initial_value: Value,
        #[serde(default)]
        constraints: Constraints,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetVariable {
        session_id: SessionId,
        identifier: String,
        /// Accepted for client compatibility. Reads always hit the store.
        #[serde(default)]
        bypass_cache: bool,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetVariables {
        session_id: SessionId,
        identifiers: Vec<String>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    SetVariable {
        session_id: SessionId,
        identifier: String,
        value: Value,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default)]
        expected_version: Option<u64>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    SetVariables {
        session_id: SessionId,
        updates: BTreeMap<String, BatchUpdate>,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default)]
        atomic: bool,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    ListVariables {
        session_id: SessionId,
    },
    DeleteVariable {
        session_id: SessionId,
        identifier: String,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    AddDependency {
        session_id: SessionId,
        from: String,
        to: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    RemoveDependency {
        session_id: SessionId,
        from: String,
        to: String,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetDependents {
        session_id: SessionId,
        identifier: String,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetDependencies {
        session_id: SessionId,
        identifier: String,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    /// `holder_id` defaults to the caller's id.
    StartOptimization {
        session_id: SessionId,
        identifier: String,
        #[serde(default)]
        holder_id: Option<String>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    StopOptimization {
        session_id: SessionId,
        identifier: String,
        #[serde(default)]
        holder_id: Option<String>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    HeartbeatOptimization {
        session_id: SessionId,
        identifier: String,
        #[serde(default)]
        holder_id: Option<String>,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetOptimizationStatus {
        session_id: SessionId,
        identifier: String,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    GetVariableHistory {
        session_id: SessionId,
        identifier: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: usize,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    RollbackVariable {
        session_id: SessionId,
        identifier: String,
        target_version: u64,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    SetVariablePermissions {
        session_id: SessionId,
        identifier: String,
        rules: Vec<AccessRule>,
    },
    CheckAccess {
        session_id: SessionId,
        identifier: String,
        operation: Operation,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    WatchVariables {
        session_id: SessionId,
        identifiers: Vec<String>,
        #[serde(default)]
        include_initial: bool,
        #[serde(default = "default_caller")]
        caller: Caller,
    },
    Unwatch {
        session_id: SessionId,
        subscription: SubscriptionId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Json,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Json, data: Json) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Json, err: &Error) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(err.into()),
        }
    }

    pub fn invalid(id: Json, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: INVALID_REQUEST.to_string(),
                message: message.into(),
            }),
        }
    }

    /// A batch reports per-key outcomes in `data` whether or not it fully
    /// succeeded.
    pub fn batch(id: Json, result: BatchResult) -> Self {
        let errors: BTreeMap<String, ErrorBody> = result
            .errors
            .iter()
            .map(|(key, err)| (key.clone(), err.into()))
            .collect();
        let success = result.is_success();
        let data = serde_json::json!({
            "success": success,
            "applied": result.applied,
            "errors": errors,
        });
        Self {
            id,
            success,
            data: Some(data),
            error: result.into_result().err().map(|err| ErrorBody::from(&err)),
        }
    }
}

/// A streamed watch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchMessage {
    pub watch: SubscriptionId,
    pub session_id: SessionId,
    /// Absent on the final message of a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<WatchEvent>,
    #[serde(default)]
    pub closed: bool,
}
