//! SQLite storage layer for Platewise

mod kv;
mod migrations;
mod parse;
mod sessions;
mod traits;
mod users;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ProfilePatch, Session, User};

pub use kv::KeyValueStore;
pub use sessions::SessionStore;
pub use traits::{SessionRepository, Storage, UserRepository};
pub use users::UserStore;

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    /// Get user store
    pub fn users(&self) -> UserStore<'_> {
        UserStore::new(&self.conn)
    }

    /// Get session store
    pub fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(&self.conn)
    }

    /// Get local key-value store
    pub fn kv(&self) -> KeyValueStore<'_> {
        KeyValueStore::new(&self.conn)
    }
}

// Implement repository traits for Database
// This enables using Database through the trait interface

impl UserRepository for Database {
    fn create_user(&self, user: &User) -> Result<()> {
        self.users().create(user)
    }

    fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.users().find_by_id(id)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.users().find_by_email(email)
    }

    fn patch_user(&self, id: Uuid, patch: &ProfilePatch) -> Result<bool> {
        self.users().apply_patch(id, patch)
    }

    fn complete_onboarding(&self, id: Uuid) -> Result<bool> {
        self.users().set_onboarding_completed(id)
    }
}

impl SessionRepository for Database {
    fn create_session(&self, session: &Session) -> Result<()> {
        self.sessions().create(session)
    }

    fn find_session(&self, token: &str) -> Result<Option<Session>> {
        self.sessions().find_by_token(token)
    }

    fn delete_session(&self, token: &str) -> Result<bool> {
        self.sessions().delete(token)
    }

    fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        self.sessions().purge_expired(now)
    }
}
