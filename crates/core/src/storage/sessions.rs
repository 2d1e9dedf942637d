//! Session storage operations
//!
//! Sessions are keyed by their token (primary key, so lookups hit the
//! unique index). Expiry is stored as unix milliseconds.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use super::parse::{parse_millis, parse_uuid, OptionalExt};
use crate::error::Result;
use crate::models::{Session, SessionToken};

pub struct SessionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a session
    #[instrument(skip(self, session), fields(user_id = %session.user_id))]
    pub fn create(&self, session: &Session) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token.as_str(),
                session.user_id.to_string(),
                session.created_at.timestamp_millis(),
                session.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Find a session by token, expired or not
    #[instrument(skip(self, token))]
    pub fn find_by_token(&self, token: &str) -> Result<Option<Session>> {
        let session = self
            .conn
            .query_row(
                "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |row| {
                    Ok(Session {
                        token: SessionToken::from(row.get::<_, String>(0)?),
                        user_id: parse_uuid(&row.get::<_, String>(1)?)?,
                        created_at: parse_millis(row.get(2)?)?,
                        expires_at: parse_millis(row.get(3)?)?,
                    })
                },
            )
            .optional()?;

        Ok(session)
    }

    /// Delete session; returns whether one existed
    pub fn delete(&self, token: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(count > 0)
    }

    /// Delete sessions whose expiry is at or before `now`
    #[instrument(skip(self))]
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let count = self.conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(count as u64)
    }
}
