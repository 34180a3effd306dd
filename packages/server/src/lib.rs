//! varsync server: a line-oriented JSON front end for [`varsync_core`].
//!
//! Each line on the input is one request object:
//!
//! ```text
//! {"id": 1, "op": "create_session", "session_id": "s"}
//! {"id": 2, "op": "register_variable", "session_id": "s", "name": "temperature",
//!  "type": "float", "initial_value": 0.7, "constraints": {"min": 0.0, "max": 2.0}}
//! {"id": 3, "op": "watch_variables", "session_id": "s", "identifiers": ["temperature"],
//!  "include_initial": true}
//! ```
//!
//! Each request gets one response line, `{"id", "success", "data" | "error"}`.
//! Watch subscriptions stream `{"watch", "session_id", "event"}` lines until
//! they end with `{"watch", "session_id", "closed": true}`.

mod error;
pub mod handler;
pub mod protocol;
mod stdio;

pub use error::ServerError;
pub use handler::{Handled, Handler};
pub use protocol::{ErrorBody, Request, Response, WatchMessage};
pub use stdio::serve;
