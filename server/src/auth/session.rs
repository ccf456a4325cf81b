//! Agent Sessions
//!
//! Sessions are created by the login service, which stores them in
//! `agent_sessions` and hands the browser a signed cookie of the form
//! `s:<session id>.<signature>`. This module only verifies the cookie and
//! reads the session back.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;

use super::error::AuthResult;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_PREFIX: &str = "s:";

/// Authenticated agent bound to one request.
///
/// Passed explicitly to everything that needs the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SessionContext {
    #[sqlx(rename = "id")]
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionContext {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

fn signature(session_id: &str, secret: &str) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(session_id.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Produce the cookie value the login service issues for `session_id`.
pub fn sign_session_id(session_id: &str, secret: &str) -> String {
    format!(
        "{SIGNED_PREFIX}{session_id}.{}",
        STANDARD_NO_PAD.encode(signature(session_id, secret))
    )
}

/// Verify a session cookie value and return the session id it carries.
///
/// Accepts the raw or percent-encoded form. Returns `None` for unsigned,
/// malformed or tampered values.
pub fn unsign_session_cookie(cookie_value: &str, secret: &str) -> Option<String> {
    let decoded = urlencoding::decode(cookie_value).ok()?;
    let signed = decoded.strip_prefix(SIGNED_PREFIX)?;
    let (session_id, provided) = signed.rsplit_once('.')?;
    if session_id.is_empty() {
        return None;
    }
    let provided = STANDARD_NO_PAD.decode(provided.trim_end_matches('=')).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(session_id.as_bytes());
    mac.verify_slice(&provided).ok()?;
    Some(session_id.to_string())
}

/// Looks up sessions written by the login service.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Return the session for `session_id`, expired or not.
    async fn resolve(&self, session_id: &str) -> AuthResult<Option<SessionContext>>;
}

/// Session resolver reading the `agent_sessions` table.
#[derive(Clone)]
pub struct PgSessionResolver {
    pool: PgPool,
}

impl PgSessionResolver {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionResolver for PgSessionResolver {
    async fn resolve(&self, session_id: &str) -> AuthResult<Option<SessionContext>> {
        let session = sqlx::query_as::<_, SessionContext>(
            "SELECT id, agent_id, agent_name, expires_at FROM agent_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }
}

/// Session resolver held in memory (tests, local runs).
#[derive(Debug, Default)]
pub struct MemorySessionResolver {
    sessions: DashMap<String, SessionContext>,
}

impl MemorySessionResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionContext) {
        self.sessions.insert(session.session_id.clone(), session);
    }
}

#[async_trait]
impl SessionResolver for MemorySessionResolver {
    async fn resolve(&self, session_id: &str) -> AuthResult<Option<SessionContext>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "keyboard cat";

    #[test]
    fn signed_cookie_round_trips() {
        let cookie = sign_session_id("abc123", SECRET);
        assert!(cookie.starts_with("s:abc123."));
        assert!(!cookie.ends_with('='));
        assert_eq!(
            unsign_session_cookie(&cookie, SECRET).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn percent_encoded_cookie_is_accepted() {
        let cookie = sign_session_id("abc123", SECRET);
        let encoded = urlencoding::encode(&cookie).into_owned();
        assert!(encoded.starts_with("s%3A"));
        assert_eq!(
            unsign_session_cookie(&encoded, SECRET).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn tampered_or_unsigned_cookies_are_rejected() {
        let cookie = sign_session_id("abc123", SECRET);
        let forged = cookie.replacen("abc123", "abc124", 1);

        assert!(unsign_session_cookie(&forged, SECRET).is_none());
        assert!(unsign_session_cookie(&cookie, "other secret").is_none());
        assert!(unsign_session_cookie("abc123", SECRET).is_none());
        assert!(unsign_session_cookie("s:abc123", SECRET).is_none());
        assert!(unsign_session_cookie("s:.sig", SECRET).is_none());
    }

    #[tokio::test]
    async fn memory_resolver_returns_inserted_sessions() {
        let resolver = MemorySessionResolver::new();
        resolver.insert(SessionContext {
            session_id: "s1".into(),
            agent_id: "agent-1".into(),
            agent_name: "Ada".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        });

        let found = resolver.resolve("s1").await.unwrap().unwrap();
        assert_eq!(found.agent_id, "agent-1");
        assert!(!found.is_expired());
        assert!(resolver.resolve("s2").await.unwrap().is_none());
    }
}

#[cfg(test)]
mod postgres_tests {
    use chrono::{Duration, Utc};
    use sqlx::PgPool;

    use super::*;

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_resolves_sessions_from_table(pool: PgPool) {
        let expires_at = Utc::now() + Duration::hours(24);
        sqlx::query(
            "INSERT INTO agent_sessions (id, agent_id, agent_name, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind("sess-1")
        .bind("agent-1")
        .bind("Ada")
        .bind(expires_at)
        .execute(&pool)
        .await
        .expect("Failed to insert session");

        let resolver = PgSessionResolver::new(pool);
        let session = resolver
            .resolve("sess-1")
            .await
            .unwrap()
            .expect("Session should resolve");
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.agent_id, "agent-1");
        assert_eq!(session.agent_name, "Ada");
        assert_eq!(
            session.expires_at.timestamp_micros(),
            expires_at.timestamp_micros()
        );

        assert!(resolver.resolve("missing").await.unwrap().is_none());
    }
}
