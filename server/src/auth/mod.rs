//! Agent Authentication
//!
//! Binds requests to agent sessions issued by the login service and decides
//! which conversations an agent may act on.

mod error;
pub mod gate;
mod middleware;
pub mod session;

pub use error::{AuthError, AuthResult, ErrorResponse};
pub use gate::{AccessPolicy, Action, Decision, SessionGate, SharedInbox};
pub use middleware::{authenticate, require_session};
pub use session::{
    sign_session_id, unsign_session_cookie, MemorySessionResolver, PgSessionResolver,
    SessionContext, SessionResolver,
};
