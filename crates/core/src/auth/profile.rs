//! Profile updates for the session owner

use tracing::{info, instrument};

use super::validator::SessionValidator;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{redact, ProfilePatch};
use crate::storage::{SessionRepository, UserRepository};

pub struct ProfileMutator<'a, S: ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
}

impl<'a, S> ProfileMutator<'a, S>
where
    S: SessionRepository + UserRepository + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Apply `patch` to the caller's user record.
    ///
    /// Fails with `Unauthorized` before touching anything if the token is
    /// not live. An empty patch succeeds without writing.
    #[instrument(skip_all, fields(token = %redact(token)))]
    pub fn update_profile(&self, token: &str, patch: &ProfilePatch) -> Result<()> {
        let (_, user) = SessionValidator::new(self.store, self.clock)
            .resolve(token)?
            .ok_or(Error::Unauthorized)?;

        if patch.is_empty() {
            return Ok(());
        }

        if !self.store.patch_user(user.id, patch)? {
            return Err(Error::NotFound(format!("user {}", user.id)));
        }

        info!(user_id = %user.id, "Profile updated");
        Ok(())
    }

    /// Mark the caller's onboarding as completed
    #[instrument(skip_all, fields(token = %redact(token)))]
    pub fn complete_onboarding(&self, token: &str) -> Result<()> {
        let (_, user) = SessionValidator::new(self.store, self.clock)
            .resolve(token)?
            .ok_or(Error::Unauthorized)?;

        if !self.store.complete_onboarding(user.id)? {
            return Err(Error::NotFound(format!("user {}", user.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Session, User};
    use crate::storage::Database;
    use chrono::{Duration, Utc};

    fn setup() -> (Database, ManualClock, User, Session) {
        let db = Database::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc::now());
        let user = User::new("p@example.com".into(), "Pat".into(), "h".into());
        db.create_user(&user).unwrap();
        let session = Session::new(user.id, clock.now(), Duration::minutes(5));
        db.create_session(&session).unwrap();
        (db, clock, user, session)
    }

    #[test]
    fn test_omitted_field_is_untouched() {
        let (db, clock, user, session) = setup();
        let mutator = ProfileMutator::new(&db, &clock);
        let token = session.token.as_str();

        mutator
            .update_profile(token, &ProfilePatch::default().with_name("Patricia"))
            .unwrap();
        mutator
            .update_profile(token, &ProfilePatch::default().with_daily_calorie_goal(1800))
            .unwrap();

        let stored = db.find_user_by_id(user.id).unwrap().unwrap();
        assert_eq!(stored.name, "Patricia");
        assert_eq!(stored.daily_calorie_goal, Some(1800));
    }

    #[test]
    fn test_empty_patch_requires_session() {
        let (db, clock, user, session) = setup();
        let mutator = ProfileMutator::new(&db, &clock);

        mutator
            .update_profile(session.token.as_str(), &ProfilePatch::default())
            .unwrap();
        mutator
            .update_profile(session.token.as_str(), &ProfilePatch::default())
            .unwrap();
        assert_eq!(db.find_user_by_id(user.id).unwrap().unwrap().name, "Pat");

        let err = mutator
            .update_profile("bogus", &ProfilePatch::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[test]
    fn test_expired_session_applies_nothing() {
        let (db, clock, user, session) = setup();
        let mutator = ProfileMutator::new(&db, &clock);
        clock.advance(Duration::minutes(6));

        let patch = ProfilePatch::default()
            .with_name("Mallory")
            .with_daily_calorie_goal(9000);
        let err = mutator
            .update_profile(session.token.as_str(), &patch)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        let stored = db.find_user_by_id(user.id).unwrap().unwrap();
        assert_eq!(stored.name, "Pat");
        assert_eq!(stored.daily_calorie_goal, None);
    }

    #[test]
    fn test_complete_onboarding() {
        let (db, clock, user, session) = setup();
        let mutator = ProfileMutator::new(&db, &clock);

        mutator.complete_onboarding(session.token.as_str()).unwrap();
        assert!(db.find_user_by_id(user.id).unwrap().unwrap().onboarding_completed);
    }
}
