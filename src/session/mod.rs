//! Session Manager: one container-backed workspace per Session, the lifecycle
//! state machine driving it, and Exec/ExecStream dispatch through the
//! resolved Agent's Engine Adapter.

mod manager;

pub use manager::{CreateSessionRequest, ExecRequest, SessionManager};
