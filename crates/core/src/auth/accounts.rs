//! Account lifecycle: sign-up, sign-in, sign-out, expiry sweep

use chrono::Duration;
use tracing::{info, instrument, warn};

use super::password::{hash_password, verify_password};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{redact, PublicUser, Session, User};
use crate::storage::{SessionRepository, UserRepository};

/// Minimum accepted password length
pub const MIN_PASSWORD_LEN: usize = 8;

const BAD_CREDENTIALS: &str = "invalid email or password";

pub struct AccountService<'a, S: ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
    session_ttl: Duration,
}

/// Trim and lowercase an email, rejecting obviously malformed input
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(Error::InvalidInput(format!("invalid email: {email}"))),
    }
}

impl<'a, S> AccountService<'a, S>
where
    S: SessionRepository + UserRepository + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a dyn Clock, session_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            session_ttl,
        }
    }

    /// Register a new account
    #[instrument(skip_all)]
    pub fn sign_up(&self, email: &str, name: &str, password: &str) -> Result<PublicUser> {
        let email = normalize_email(email)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("name must not be empty".into()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::InvalidInput(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        if self.store.find_user_by_email(&email)?.is_some() {
            return Err(Error::Conflict(format!("email already registered: {email}")));
        }

        let mut user = User::new(email, name.to_string(), hash_password(password)?);
        user.created_at = self.clock.now();
        self.store.create_user(&user)?;

        info!(user_id = %user.id, "User registered");
        Ok(user.to_public())
    }

    /// Verify credentials and open a new session
    #[instrument(skip_all)]
    pub fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = normalize_email(email)
            .map_err(|_| Error::Authentication(BAD_CREDENTIALS.into()))?;

        let Some(user) = self.store.find_user_by_email(&email)? else {
            return Err(Error::Authentication(BAD_CREDENTIALS.into()));
        };

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = %user.id, "Password mismatch");
            return Err(Error::Authentication(BAD_CREDENTIALS.into()));
        }

        let session = Session::new(user.id, self.clock.now(), self.session_ttl);
        self.store.create_session(&session)?;

        info!(user_id = %user.id, expires_at = %session.expires_at, "Session created");
        Ok(session)
    }

    /// Delete the session for `token`; unknown tokens are a no-op
    #[instrument(skip_all, fields(token = %redact(token)))]
    pub fn sign_out(&self, token: &str) -> Result<()> {
        if self.store.delete_session(token)? {
            info!("Session deleted");
        }
        Ok(())
    }

    /// Remove every session whose expiry has passed
    pub fn purge_expired_sessions(&self) -> Result<u64> {
        let purged = self.store.purge_expired_sessions(self.clock.now())?;
        if purged > 0 {
            info!(purged, "Expired sessions removed");
        }
        Ok(purged)
    }
}
