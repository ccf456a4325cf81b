//! Session Middleware

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;

use crate::api::AppState;

use super::error::AuthError;
use super::session::{unsign_session_cookie, SessionContext};

/// Resolve the signed session cookie in `headers` to a live session.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<SessionContext, AuthError> {
    let jar = CookieJar::from_headers(headers);
    let cookie = jar
        .get(&state.config.session_cookie_name)
        .ok_or(AuthError::MissingSession)?;

    let session_id = unsign_session_cookie(cookie.value(), &state.config.session_secret)
        .ok_or(AuthError::InvalidSession)?;

    let session = state
        .sessions
        .resolve(&session_id)
        .await?
        .ok_or(AuthError::InvalidSession)?;

    if session.is_expired() {
        return Err(AuthError::SessionExpired);
    }
    Ok(session)
}

/// Middleware to require an agent session.
///
/// Injects the [`SessionContext`] into request extensions for handlers.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let session = authenticate(&state, request.headers()).await?;
    tracing::Span::current().record("agent_id", session.agent_id.as_str());
    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}

impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(AuthError::MissingSession)
    }
}
