//! Storage repository traits
//!
//! These traits define the storage interface the auth services run
//! against, allowing for different implementations (SQLite, mock).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ProfilePatch, Session, User};

/// User repository operations
pub trait UserRepository {
    /// Create a new user
    fn create_user(&self, user: &User) -> Result<()>;

    /// Find user by ID
    fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    /// Find user by email
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Apply a sparse patch atomically; false if no such user
    fn patch_user(&self, id: Uuid, patch: &ProfilePatch) -> Result<bool>;

    /// Set the onboarding-completed flag; false if no such user
    fn complete_onboarding(&self, id: Uuid) -> Result<bool>;
}

/// Session repository operations
pub trait SessionRepository {
    /// Create a session
    fn create_session(&self, session: &Session) -> Result<()>;

    /// Look up a session by token, regardless of expiry
    fn find_session(&self, token: &str) -> Result<Option<Session>>;

    /// Delete a session
    fn delete_session(&self, token: &str) -> Result<bool>;

    /// Delete sessions expired at `now`
    fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Combined storage interface
pub trait Storage: UserRepository + SessionRepository {}

// Blanket implementation: any type implementing all traits implements Storage
impl<T> Storage for T where T: UserRepository + SessionRepository {}
