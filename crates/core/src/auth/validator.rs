//! Session validation
//!
//! A read-only check: token → session record → expiry → user. Expired
//! records are reported as invalid but left in place; removal is the job
//! of sign-out or the expiry sweep.

use tracing::{debug, error, instrument};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{redact, PublicUser, Session, User};
use crate::storage::{SessionRepository, UserRepository};

/// Outcome of validating a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(PublicUser),
    Invalid,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn into_user(self) -> Option<PublicUser> {
        match self {
            Validation::Valid(user) => Some(user),
            Validation::Invalid => None,
        }
    }
}

pub struct SessionValidator<'a, S: ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
}

impl<'a, S> SessionValidator<'a, S>
where
    S: SessionRepository + UserRepository + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Validate a token and return the owner's public fields
    #[instrument(skip_all, fields(token = %redact(token)))]
    pub fn validate(&self, token: &str) -> Result<Validation> {
        Ok(match self.resolve(token)? {
            Some((_, user)) => Validation::Valid(user.to_public()),
            None => Validation::Invalid,
        })
    }

    /// Resolve a live session and its user, `None` when the token is not live
    pub(crate) fn resolve(&self, token: &str) -> Result<Option<(Session, User)>> {
        if token.trim().is_empty() {
            return Ok(None);
        }

        let Some(session) = self.store.find_session(token)? else {
            debug!("No session for token");
            return Ok(None);
        };

        if !session.is_valid_at(self.clock.now()) {
            debug!(expires_at = %session.expires_at, "Session expired");
            return Ok(None);
        }

        match self.store.find_user_by_id(session.user_id)? {
            Some(user) => Ok(Some((session, user))),
            None => {
                error!(user_id = %session.user_id, "Session references a missing user");
                Err(Error::NotFound(format!("user {}", session.user_id)))
            }
        }
    }
}
