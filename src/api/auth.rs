//! Request identity: session cookies for clients, bearer tokens for workers.
//!
//! Registration and login live outside this crate; sessions are only read.

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use chrono::{DateTime, Utc};

use crate::store::{SqlBackend, StoreError};

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: i64,
    pub email: String,
}

/// Value of the session cookie, if the request carries one.
pub fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// True when the request carries `Bearer <expected>`. An empty expected key
/// matches nothing.
pub fn worker_authorized(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/// Resolves session cookies against the `sessions` and `users` tables.
#[derive(Clone)]
pub struct SessionAuthenticator<B> {
    backend: B,
}

impl<B: SqlBackend> SessionAuthenticator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub async fn current_user(&self, headers: &HeaderMap) -> Result<Option<UserIdentity>, StoreError> {
        let Some(session) = session_id(headers) else {
            return Ok(None);
        };
        let rows = self
            .backend
            .execute(
                "SELECT users.id AS id, users.email AS email, sessions.expires_at AS expires_at \
                 FROM sessions JOIN users ON users.id = sessions.user_id WHERE sessions.id = ?",
                &[session.into()],
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let expires_at: DateTime<Utc> = row.get("expires_at")?;
        if expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(UserIdentity {
            id: row.get("id")?,
            email: row.get("email")?,
        }))
    }
}
