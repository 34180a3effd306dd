//! varsync core: a session-scoped, typed, versioned variable store.
//!
//! Two cooperating processes share mutable configuration through a
//! [`SessionManager`]. One side reads and watches variables while the
//! other optimizes them:
//!
//! - `Value`: dynamically-typed payload of a variable
//! - `VarType` / `TypeRegistry`: per-type coercion and constraint checks
//! - `Session`: variables, name index, dependency graph, rules and watchers
//! - `SessionManager`: concurrent registry with idle expiry and lock sweeping
//!
//! # Example
//!
//! ```rust
//! use varsync_core::{Caller, Metadata, NewVariable, SessionId, SessionManager, VarType, Value};
//!
//! let manager = SessionManager::default();
//! let session = SessionId::new("demo");
//! manager.create_session(session.clone(), None).unwrap();
//!
//! let caller = Caller::new("optimizer");
//! let temperature = NewVariable::new("temperature", VarType::Float, 0.7)
//!     .constraint("min", 0.0)
//!     .constraint("max", 2.0);
//! manager.register_variable(&session, &caller, temperature).unwrap();
//!
//! let version = manager
//!     .set_variable(&session, &caller, "temperature", Value::from(0.9), Metadata::new(), Some(0))
//!     .unwrap();
//! assert_eq!(version, 1);
//! ```

pub mod access;
mod config;
mod error;
pub mod graph;
mod id;
mod lease;
mod manager;
mod session;
pub mod types;
mod value;
mod variable;
pub mod watch;

pub use access::{AccessPolicy, AccessRule, Caller, Condition, Decision, Operation};
pub use config::{ConfigError, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use graph::{DependencyEdge, DEFAULT_EDGE_KIND};
pub use id::{OptimizationId, SessionId, SubscriptionId, VariableId};
pub use lease::{Lease, LivenessToken};
pub use manager::{ManagerStats, SessionManager, SweepReport};
pub use session::{
    BatchResult, BatchUpdate, NewVariable, Rule, Session, SessionInfo, SessionStats, SessionView,
    SweepOutcome,
};
pub use types::{Constraints, TypeRegistry, VarType};
pub use value::Value;
pub use variable::{HistoryEntry, Metadata, OptimizationStatus, Variable, VariableSummary};
pub use watch::{ChangeCause, UpdateEvent, WatchEvent, WatchStream};
