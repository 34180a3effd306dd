//! Maps requests onto [`SessionManager`] calls.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::debug;

use varsync_core::{
    AccessPolicy, Error, LivenessToken, NewVariable, SessionManager, TypeRegistry, WatchStream,
};

use crate::protocol::{Request, Response};

/// What a request produced.
pub enum Handled {
    Data(Json),
    Batch(varsync_core::BatchResult),
    Watch(WatchStream),
}

/// Request handler for one client connection.
///
/// Optimizer locks taken through a handler are tied to its connection
/// token and are released once the handler is dropped.
pub struct Handler {
    manager: Arc<SessionManager>,
    connection: LivenessToken,
}

fn data<T: Serialize>(value: T) -> Result<Handled, Error> {
    serde_json::to_value(value)
        .map(Handled::Data)
        .map_err(|e| Error::Internal(format!("failed to encode response: {}", e)))
}

impl Handler {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            connection: LivenessToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Parse and answer one request line.
    pub fn handle_line(&self, line: &str) -> (Response, Option<WatchStream>) {
        let raw: Json = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => return (Response::invalid(Json::Null, format!("malformed JSON: {}", e)), None),
        };
        let id = raw.get("id").cloned().unwrap_or(Json::Null);
        match serde_json::from_value::<Request>(raw) {
            Ok(request) => self.respond(id, request),
            Err(e) => (Response::invalid(id, e.to_string()), None),
        }
    }

    pub fn respond(&self, id: Json, request: Request) -> (Response, Option<WatchStream>) {
        match self.execute(request) {
            Ok(Handled::Data(data)) => (Response::ok(id, data), None),
            Ok(Handled::Batch(result)) => (Response::batch(id, result), None),
            Ok(Handled::Watch(stream)) => {
                let data = json!({
                    "subscription": stream.id(),
                    "session_id": stream.session(),
                });
                (Response::ok(id, data), Some(stream))
            }
            Err(err) => {
                debug!(kind = %err.kind(), error = %err, "request failed");
                (Response::error(id, &err), None)
            }
        }
    }

    pub fn execute(&self, request: Request) -> Result<Handled, Error> {
        let m = &self.manager;
        match request {
            Request::CreateSession {
                session_id,
                ttl_secs,
            } => data(m.create_session(session_id, ttl_secs.map(Duration::from_secs))?),
            Request::CleanupSession { session_id } => {
                m.cleanup_session(&session_id)?;
                data(json!({ "session_id": session_id }))
            }
            Request::ListSessions => data(m.list_sessions()),
            Request::SessionInfo { session_id } => data(m.session_info(&session_id)?),
            Request::SessionStats { session_id } => data(m.session_stats(&session_id)?),
            Request::TouchSession { session_id } => {
                m.touch(&session_id)?;
                data(m.session_info(&session_id)?)
            }
            Request::Stats => data(m.stats()),

            Request::RegisterVariable {
                session_id,
                name,
                var_type,
                initial_value,
                constraints,
                metadata,
                caller,
            } => {
                let new = NewVariable {
                    name,
                    var_type: TypeRegistry::lookup(&var_type)?,
                    value: initial_value,
                    constraints,
                    metadata,
                };
                let id = m.register_variable(&session_id, &caller, new)?;
                data(json!({ "variable_id": id }))
            }
            Request::GetVariable {
                session_id,
                identifier,
                bypass_cache: _,
                caller,
            } => data(m.get_variable(&session_id, &caller, &identifier)?),
            Request::GetVariables {
                session_id,
                identifiers,
                caller,
            } => data(m.get_variables(&session_id, &caller, identifiers.as_slice())?),
            Request::SetVariable {
                session_id,
                identifier,
                value,
                metadata,
                expected_version,
                caller,
            } => {
                let version =
                    m.set_variable(&session_id, &caller, &identifier, value, metadata, expected_version)?;
                data(json!({ "version": version }))
            }
            Request::SetVariables {
                session_id,
                updates,
                metadata,
                atomic,
                caller,
            } => Ok(Handled::Batch(m.set_variables(
                &session_id,
                &caller,
                updates,
                metadata,
                atomic,
            )?)),
            Request::ListVariables { session_id } => data(m.list_variables(&session_id)?),
            Request::DeleteVariable {
                session_id,
                identifier,
                caller,
            } => data(m.delete_variable(&session_id, &caller, &identifier)?),

            Request::AddDependency {
                session_id,
                from,
                to,
                kind,
                caller,
            } => {
                m.add_dependency(&session_id, &caller, &from, &to, kind.as_deref())?;
                data(json!({ "from": from, "to": to }))
            }
            Request::RemoveDependency {
                session_id,
                from,
                to,
                caller,
            } => {
                let removed = m.remove_dependency(&session_id, &caller, &from, &to)?;
                data(json!({ "removed": removed }))
            }
            Request::GetDependents {
                session_id,
                identifier,
                caller,
            } => data(m.dependents(&session_id, &caller, &identifier)?),
            Request::GetDependencies {
                session_id,
                identifier,
                caller,
            } => data(m.dependencies(&session_id, &caller, &identifier)?),

            Request::StartOptimization {
                session_id,
                identifier,
                holder_id,
                caller,
            } => {
                let holder = holder_id.unwrap_or_else(|| caller.id.clone());
                let optimization_id = m.start_optimization(
                    &session_id,
                    &caller,
                    &identifier,
                    &holder,
                    Some(&self.connection),
                )?;
                data(json!({ "optimization_id": optimization_id, "holder_id": holder }))
            }
            Request::StopOptimization {
                session_id,
                identifier,
                holder_id,
                caller,
            } => {
                let holder = holder_id.unwrap_or_else(|| caller.id.clone());
                m.stop_optimization(&session_id, &caller, &identifier, &holder)?;
                data(json!({ "holder_id": holder }))
            }
            Request::HeartbeatOptimization {
                session_id,
                identifier,
                holder_id,
                caller,
            } => {
                let holder = holder_id.unwrap_or_else(|| caller.id.clone());
                m.heartbeat_optimization(&session_id, &caller, &identifier, &holder)?;
                data(json!({ "holder_id": holder }))
            }
            Request::GetOptimizationStatus {
                session_id,
                identifier,
                caller,
            } => data(m.optimization_status(&session_id, &caller, &identifier)?),

            Request::GetVariableHistory {
                session_id,
                identifier,
                limit,
                offset,
                caller,
            } => data(m.variable_history(&session_id, &caller, &identifier, limit, offset)?),
            Request::RollbackVariable {
                session_id,
                identifier,
                target_version,
                caller,
            } => {
                let version = m.rollback_variable(&session_id, &caller, &identifier, target_version)?;
                data(json!({ "version": version }))
            }

            Request::SetVariablePermissions {
                session_id,
                identifier,
                rules,
            } => {
                let count = rules.len();
                m.set_permissions(&session_id, &identifier, AccessPolicy::new(rules))?;
                data(json!({ "rules": count }))
            }
            Request::CheckAccess {
                session_id,
                identifier,
                operation,
                caller,
            } => {
                let decision = m.check_access(&session_id, &caller, &identifier, operation)?;
                data(json!({ "decision": decision }))
            }

            Request::WatchVariables {
                session_id,
                identifiers,
                include_initial,
                caller,
            } => Ok(Handled::Watch(m.watch_variables(
                &session_id,
                &caller,
                identifiers.as_slice(),
                include_initial,
            )?)),
            Request::Unwatch {
                session_id,
                subscription,
            } => {
                let removed = m.unwatch(&session_id, subscription)?;
                data(json!({ "removed": removed }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Handler {
        Handler::new(Arc::new(SessionManager::default()))
    }

    #[test]
    fn malformed_line_is_invalid_request() {
        let (response, stream) = handler().handle_line("{not json");
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "invalid_request");
        assert!(stream.is_none());
    }

    #[test]
    fn unknown_op_keeps_the_request_id() {
        let (response, _) = handler().handle_line(r#"{"id": 7, "op": "explode"}"#);
        assert_eq!(response.id, json!(7));
        assert_eq!(response.error.unwrap().kind, "invalid_request");
    }

    #[test]
    fn unknown_type_tag_is_reported() {
        let h = handler();
        h.handle_line(r#"{"id": 1, "op": "create_session", "session_id": "s"}"#);
        let (response, _) = h.handle_line(
            r#"{"id": 2, "op": "register_variable", "session_id": "s", "name": "x", "type": "blob", "initial_value": 1}"#,
        );
        assert_eq!(response.error.unwrap().kind, "unknown_type");
    }

    #[test]
    fn dropping_the_handler_releases_its_locks() {
        let manager = Arc::new(SessionManager::default());
        let h = Handler::new(Arc::clone(&manager));
        for line in [
            r#"{"id": 1, "op": "create_session", "session_id": "s"}"#,
            r#"{"id": 2, "op": "register_variable", "session_id": "s", "name": "t", "type": "float", "initial_value": 0.5}"#,
            r#"{"id": 3, "op": "start_optimization", "session_id": "s", "identifier": "t", "holder_id": "opt1"}"#,
        ] {
            assert!(h.handle_line(line).0.success, "{}", line);
        }
        drop(h);

        let other = Handler::new(manager);
        let (response, _) = other.handle_line(
            r#"{"id": 4, "op": "get_optimization_status", "session_id": "s", "identifier": "t"}"#,
        );
        assert_eq!(response.data.unwrap()["locked"], json!(false));
    }
}
