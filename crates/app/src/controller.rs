//! Client auth controller
//!
//! Owns the persisted token and drives the auth phase from validation
//! results. State lives in a watch channel; every transition is one
//! synchronous `send_*` call, so no lock is held across an await.
//!
//! Every result is checked against the token it was issued for (and the
//! epoch at issue time) before it is applied. A slow reply for a token that
//! has since been signed out or replaced is dropped.

use platewise_core::models::redact;
use platewise_core::{ProfilePatch, PublicUser};
use platewise_net::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::AuthBackend;
use crate::state::{AuthPhase, AuthReceiver, AuthSnapshot, AuthState};
use crate::token_store::TokenStore;

/// Identity of an outstanding validation
#[derive(Debug, Clone)]
struct Ticket {
    epoch: u64,
    token: String,
}

pub struct AuthController<B, S> {
    backend: B,
    store: S,
    state: watch::Sender<AuthState>,
}

impl<B, S> AuthController<B, S>
where
    B: AuthBackend,
    S: TokenStore,
{
    pub fn new(backend: B, store: S) -> Self {
        let (state, _) = watch::channel(AuthState::initial());
        Self {
            backend,
            store,
            state,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.state.borrow().snapshot()
    }

    pub fn user(&self) -> Option<PublicUser> {
        self.state.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn phase(&self) -> AuthPhase {
        self.state.borrow().phase
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> AuthReceiver {
        AuthReceiver::new(self.state.subscribe())
    }

    /// Load the persisted token and validate it. Runs at most once.
    ///
    /// Returns the transport error if validation could not complete; the
    /// loading flag is cleared either way.
    pub async fn boot(&self) -> platewise_net::Result<()> {
        let mut first = false;
        self.state.send_if_modified(|s| {
            first = !s.boot_started;
            s.boot_started = true;
            false
        });
        if !first {
            debug!("Boot already ran");
            return Ok(());
        }

        let stored = match self.store.load() {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                error!(error = %e, "Failed to read stored token");
                None
            }
        };

        let mut ticket = None;
        self.state.send_if_modified(|s| {
            // A sign-in that raced ahead of boot wins
            if s.phase != AuthPhase::Booting {
                return false;
            }
            match &stored {
                None => {
                    s.phase = AuthPhase::Unauthenticated;
                    s.loading = false;
                }
                Some(token) => {
                    s.phase = AuthPhase::Authenticating;
                    s.token = Some(token.clone());
                    ticket = Some(Ticket {
                        epoch: s.epoch,
                        token: token.clone(),
                    });
                }
            }
            true
        });

        match ticket {
            Some(ticket) => {
                info!(token = %redact(&ticket.token), "Validating stored token");
                self.run_validation(ticket).await
            }
            None => Ok(()),
        }
    }

    /// Adopt a new token and validate it, replacing any current identity
    pub async fn sign_in(&self, token: impl Into<String>) -> platewise_net::Result<()> {
        let token = token.into();
        let mut ticket = None;

        self.state.send_modify(|s| {
            if let Err(e) = self.store.save(&token) {
                warn!(error = %e, "Failed to persist token; session will not survive restart");
            }
            s.epoch += 1;
            s.boot_started = true;
            s.token = Some(token.clone());
            s.user = None;
            s.phase = AuthPhase::Authenticating;
            s.loading = true;
            ticket = Some(Ticket {
                epoch: s.epoch,
                token: token.clone(),
            });
        });

        match ticket {
            Some(ticket) => self.run_validation(ticket).await,
            None => Ok(()),
        }
    }

    /// Forget the session locally, then revoke it on the server.
    ///
    /// Local state is cleared even if the stored token cannot be deleted;
    /// failures are logged, not returned. Works before `boot`, revoking
    /// whatever token was persisted.
    pub async fn sign_out(&self) {
        let mut revoked = None;
        self.state.send_modify(|s| {
            let persisted = match s.token {
                Some(_) => None,
                None => self.store.load().ok().flatten(),
            };
            if let Err(e) = self.store.clear() {
                error!(error = %e, "Failed to purge stored token");
            }
            revoked = s.token.take().or(persisted);
            s.boot_started = true;
            s.epoch += 1;
            s.user = None;
            s.phase = AuthPhase::Unauthenticated;
            s.loading = false;
        });

        if let Some(token) = revoked {
            info!(token = %redact(&token), "Signed out");
            if let Err(e) = self.backend.revoke(&token).await {
                warn!(error = %e, "Server-side sign-out failed");
            }
        }
    }

    /// Re-validate the current token without dropping it first
    pub async fn refresh(&self) -> platewise_net::Result<()> {
        let mut ticket = None;
        self.state.send_if_modified(|s| {
            let Some(token) = &s.token else {
                return false;
            };
            ticket = Some(Ticket {
                epoch: s.epoch,
                token: token.clone(),
            });
            s.phase = AuthPhase::Authenticating;
            true
        });

        match ticket {
            Some(ticket) => self.run_validation(ticket).await,
            None => {
                debug!("Refresh without a token");
                Ok(())
            }
        }
    }

    /// Apply a pushed result for `token`; false if the token is not current
    pub fn apply_update(&self, token: &str, user: Option<PublicUser>) -> bool {
        self.settle(None, token, user)
    }

    /// Patch the signed-in user's profile, then re-read it
    pub async fn update_profile(&self, patch: ProfilePatch) -> platewise_net::Result<()> {
        let ticket = self.current()?;
        let result = self.backend.update_profile(&ticket.token, patch).await;
        self.after_mutation(ticket, result).await
    }

    /// Mark onboarding done for the signed-in user, then re-read it
    pub async fn complete_onboarding(&self) -> platewise_net::Result<()> {
        let ticket = self.current()?;
        let result = self.backend.complete_onboarding(&ticket.token).await;
        self.after_mutation(ticket, result).await
    }

    /// Subscribe to live results for the current token.
    ///
    /// The initial result is applied like a validation; later pushes
    /// arrive through `apply_update`.
    pub async fn watch(&self) -> platewise_net::Result<()> {
        let ticket = self.current()?;
        let result = self.backend.watch(&ticket.token).await;
        self.resolve(ticket, result)
    }

    fn current(&self) -> platewise_net::Result<Ticket> {
        let s = self.state.borrow();
        match &s.token {
            Some(token) => Ok(Ticket {
                epoch: s.epoch,
                token: token.clone(),
            }),
            None => Err(Error::NotSignedIn),
        }
    }

    async fn after_mutation(
        &self,
        ticket: Ticket,
        result: platewise_net::Result<()>,
    ) -> platewise_net::Result<()> {
        match result {
            Ok(()) => self.refresh().await,
            Err(e) if e.is_unauthorized() => {
                self.settle(Some(ticket.epoch), &ticket.token, None);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_validation(&self, ticket: Ticket) -> platewise_net::Result<()> {
        let result = self.backend.validate(&ticket.token).await;
        self.resolve(ticket, result)
    }

    /// Apply the outcome of a validation issued under `ticket`
    fn resolve(
        &self,
        ticket: Ticket,
        result: platewise_net::Result<Option<PublicUser>>,
    ) -> platewise_net::Result<()> {
        match result {
            Ok(user) => {
                if !self.settle(Some(ticket.epoch), &ticket.token, user) {
                    debug!(token = %redact(&ticket.token), "Discarded stale validation result");
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Token validation failed");
                self.state.send_if_modified(|s| {
                    if s.epoch != ticket.epoch || !s.holds(&ticket.token) {
                        return false;
                    }
                    // Keep the token: a transport failure is not an invalidation
                    s.loading = false;
                    s.phase = if s.user.is_some() {
                        AuthPhase::Authenticated
                    } else {
                        AuthPhase::Unauthenticated
                    };
                    true
                });
                Err(e)
            }
        }
    }

    /// Apply a definitive result if it still concerns the current token
    fn settle(&self, epoch: Option<u64>, token: &str, user: Option<PublicUser>) -> bool {
        self.state.send_if_modified(|s| {
            if !s.holds(token) || epoch.is_some_and(|e| e != s.epoch) {
                return false;
            }

            match user {
                Some(user) => {
                    s.user = Some(user);
                    s.phase = AuthPhase::Authenticated;
                }
                None => {
                    info!(token = %redact(token), "Token rejected by server");
                    if let Err(e) = self.store.clear() {
                        error!(error = %e, "Failed to purge rejected token");
                    }
                    s.token = None;
                    s.user = None;
                    s.epoch += 1;
                    s.phase = AuthPhase::Unauthenticated;
                }
            }
            s.loading = false;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use platewise_core::{Error as CoreError, Result as CoreResult};
    use platewise_net::{Error as NetError, ErrorKind};
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;
    use crate::token_store::MemoryTokenStore;

    #[derive(Clone)]
    enum Reply {
        Valid(PublicUser),
        Invalid,
        Fail,
    }

    #[derive(Default)]
    struct MockBackend {
        replies: Mutex<HashMap<String, Reply>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        revoked: Mutex<Vec<String>>,
        revoke_fails: AtomicBool,
    }

    impl MockBackend {
        fn reply(self, token: &str, reply: Reply) -> Self {
            self.replies.lock().unwrap().insert(token.to_string(), reply);
            self
        }

        fn set(&self, token: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(token.to_string(), reply);
        }

        /// Apply `change` to the user behind a valid token
        fn mutate(
            &self,
            token: &str,
            change: impl FnOnce(&mut PublicUser),
        ) -> platewise_net::Result<()> {
            match self.replies.lock().unwrap().get_mut(token) {
                Some(Reply::Valid(user)) => {
                    change(user);
                    Ok(())
                }
                Some(Reply::Fail) => Err(NetError::Timeout),
                Some(Reply::Invalid) | None => Err(NetError::Remote {
                    kind: ErrorKind::Unauthorized,
                    message: "Unauthorized".into(),
                }),
            }
        }

        fn gate(&self, token: &str) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            self.gates
                .lock()
                .unwrap()
                .insert(token.to_string(), notify.clone());
            notify
        }
    }

    #[async_trait]
    impl AuthBackend for MockBackend {
        async fn validate(&self, token: &str) -> platewise_net::Result<Option<PublicUser>> {
            let gate = self.gates.lock().unwrap().get(token).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let reply = self.replies.lock().unwrap().get(token).cloned();
            match reply {
                Some(Reply::Valid(user)) => Ok(Some(user)),
                Some(Reply::Invalid) | None => Ok(None),
                Some(Reply::Fail) => Err(NetError::Timeout),
            }
        }

        async fn revoke(&self, token: &str) -> platewise_net::Result<()> {
            if self.revoke_fails.load(Ordering::SeqCst) {
                return Err(NetError::NotConnected);
            }
            self.revoked.lock().unwrap().push(token.to_string());
            Ok(())
        }

        async fn update_profile(
            &self,
            token: &str,
            patch: ProfilePatch,
        ) -> platewise_net::Result<()> {
            self.mutate(token, |user| {
                if let Some(name) = patch.name {
                    user.name = name;
                }
                if let Some(goal) = patch.daily_calorie_goal {
                    user.daily_calorie_goal = Some(goal);
                }
            })
        }

        async fn complete_onboarding(&self, token: &str) -> platewise_net::Result<()> {
            self.mutate(token, |user| user.onboarding_completed = true)
        }

        async fn watch(&self, token: &str) -> platewise_net::Result<Option<PublicUser>> {
            self.validate(token).await
        }
    }

    /// Store whose deletes always fail
    struct StickyStore {
        inner: MemoryTokenStore,
        fail_clear: AtomicBool,
    }

    impl TokenStore for StickyStore {
        fn load(&self) -> CoreResult<Option<String>> {
            self.inner.load()
        }
        fn save(&self, token: &str) -> CoreResult<()> {
            self.inner.save(token)
        }
        fn clear(&self) -> CoreResult<()> {
            if self.fail_clear.load(Ordering::SeqCst) {
                return Err(CoreError::Io(std::io::Error::other("disk gone")));
            }
            self.inner.clear()
        }
    }

    fn user(name: &str) -> PublicUser {
        PublicUser {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", name.to_lowercase()),
            name: name.to_string(),
            onboarding_completed: true,
            daily_calorie_goal: Some(2000),
        }
    }

    #[tokio::test]
    async fn test_boot_without_token() {
        let controller = AuthController::new(MockBackend::default(), MemoryTokenStore::default());
        assert_eq!(controller.phase(), AuthPhase::Booting);
        assert!(controller.is_loading());

        controller.boot().await.unwrap();

        assert_eq!(
            controller.snapshot(),
            AuthSnapshot {
                phase: AuthPhase::Unauthenticated,
                user: None,
                loading: false,
            }
        );
    }

    #[tokio::test]
    async fn test_boot_valid_token_then_sign_out() {
        let u1 = user("Una");
        let backend = MockBackend::default().reply("abc", Reply::Valid(u1.clone()));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));

        controller.boot().await.unwrap();
        assert_eq!(controller.phase(), AuthPhase::Authenticated);
        assert_eq!(controller.user(), Some(u1));
        assert!(!controller.is_loading());

        controller.sign_out().await;
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.user(), None);
        assert_eq!(controller.store.load().unwrap(), None);
        assert_eq!(*controller.backend.revoked.lock().unwrap(), vec!["abc"]);
    }

    #[tokio::test]
    async fn test_invalid_token_is_purged() {
        let backend = MockBackend::default().reply("stale", Reply::Invalid);
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("stale"));

        controller.boot().await.unwrap();

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert!(!controller.is_loading());
        assert_eq!(controller.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_boot_runs_once() {
        let backend = MockBackend::default().reply("abc", Reply::Valid(user("Ola")));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));

        controller.boot().await.unwrap();
        controller.sign_out().await;
        controller.boot().await.unwrap();

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_transport_failure_clears_loading_and_keeps_token() {
        let backend = MockBackend::default().reply("abc", Reply::Fail);
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));

        assert!(controller.boot().await.is_err());

        assert!(!controller.is_loading());
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.store.load().unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_user_signed_in() {
        let u1 = user("Rae");
        let backend = MockBackend::default().reply("abc", Reply::Valid(u1.clone()));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));
        controller.boot().await.unwrap();

        controller.backend.set("abc", Reply::Fail);
        assert!(controller.refresh().await.is_err());

        assert_eq!(controller.phase(), AuthPhase::Authenticated);
        assert_eq!(controller.user(), Some(u1));
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_profile_changes() {
        let before = user("Sol");
        let mut after = before.clone();
        after.daily_calorie_goal = Some(1500);
        let backend = MockBackend::default().reply("abc", Reply::Valid(before));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));
        controller.boot().await.unwrap();

        controller.backend.set("abc", Reply::Valid(after.clone()));
        controller.refresh().await.unwrap();

        assert_eq!(controller.user(), Some(after));
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_sign_in_replaces_identity() {
        let (a, b) = (user("Ann"), user("Ben"));
        let backend = MockBackend::default()
            .reply("tok-a", Reply::Valid(a))
            .reply("tok-b", Reply::Valid(b.clone()));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("tok-a"));
        controller.boot().await.unwrap();

        controller.sign_in("tok-b").await.unwrap();

        assert_eq!(controller.user(), Some(b));
        assert_eq!(controller.store.load().unwrap().as_deref(), Some("tok-b"));
    }

    #[tokio::test]
    async fn test_stale_validation_does_not_resurrect_session() {
        let backend = MockBackend::default().reply("slow", Reply::Valid(user("Zed")));
        let gate = backend.gate("slow");
        let controller = Arc::new(AuthController::new(backend, MemoryTokenStore::default()));
        controller.boot().await.unwrap();

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.sign_in("slow").await })
        };
        // Let the sign-in reach the backend
        while controller.phase() != AuthPhase::Authenticating {
            tokio::task::yield_now().await;
        }

        controller.sign_out().await;
        gate.notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.user(), None);
        assert_eq!(controller.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_invalidation_does_not_purge_new_token() {
        let backend = MockBackend::default()
            .reply("old", Reply::Invalid)
            .reply("new", Reply::Valid(user("Nia")));
        let gate = backend.gate("old");
        let controller = Arc::new(AuthController::new(
            backend,
            MemoryTokenStore::with_token("old"),
        ));

        let booting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.boot().await })
        };
        while controller.phase() != AuthPhase::Authenticating {
            tokio::task::yield_now().await;
        }

        controller.sign_in("new").await.unwrap();
        gate.notify_one();
        booting.await.unwrap().unwrap();

        assert_eq!(controller.phase(), AuthPhase::Authenticated);
        assert_eq!(controller.store.load().unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_sign_out_clears_state_when_store_fails() {
        let backend = MockBackend::default().reply("abc", Reply::Valid(user("Kai")));
        let store = StickyStore {
            inner: MemoryTokenStore::with_token("abc"),
            fail_clear: AtomicBool::new(true),
        };
        let controller = AuthController::new(backend, store);
        controller.boot().await.unwrap();

        controller.sign_out().await;

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.user(), None);
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_pushed_updates_are_token_guarded() {
        let u1 = user("Lou");
        let backend = MockBackend::default().reply("abc", Reply::Valid(u1.clone()));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));
        controller.boot().await.unwrap();
        let mut rx = controller.subscribe();

        assert!(!controller.apply_update("someone-else", None));
        assert_eq!(controller.user(), Some(u1.clone()));

        let mut renamed = u1;
        renamed.name = "Louise".into();
        assert!(controller.apply_update("abc", Some(renamed.clone())));
        assert!(rx.changed().await);
        assert_eq!(rx.snapshot().user, Some(renamed));

        assert!(controller.apply_update("abc", None));
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_sign_out_before_boot_revokes_persisted_token() {
        let controller =
            AuthController::new(MockBackend::default(), MemoryTokenStore::with_token("abc"));

        controller.sign_out().await;

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.store.load().unwrap(), None);
        assert_eq!(*controller.backend.revoked.lock().unwrap(), vec!["abc"]);
    }

    #[tokio::test]
    async fn test_sign_out_with_unreachable_backend_clears_store() {
        let backend = MockBackend::default().reply("abc", Reply::Fail);
        backend.revoke_fails.store(true, Ordering::SeqCst);
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));

        assert!(controller.boot().await.is_err());
        controller.sign_out().await;

        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert!(!controller.is_loading());
        assert_eq!(controller.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_profile_rereads_user() {
        let backend = MockBackend::default().reply("abc", Reply::Valid(user("Pia")));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));
        controller.boot().await.unwrap();

        controller
            .update_profile(ProfilePatch::default().with_daily_calorie_goal(1800))
            .await
            .unwrap();
        controller.complete_onboarding().await.unwrap();

        let current = controller.user().unwrap();
        assert_eq!(current.name, "Pia");
        assert_eq!(current.daily_calorie_goal, Some(1800));
        assert!(current.onboarding_completed);
        assert_eq!(controller.phase(), AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_rejected_mutation_purges_session() {
        let backend = MockBackend::default().reply("abc", Reply::Valid(user("Quin")));
        let controller = AuthController::new(backend, MemoryTokenStore::with_token("abc"));
        controller.boot().await.unwrap();
        controller.backend.set("abc", Reply::Invalid);

        let err = controller
            .update_profile(ProfilePatch::default().with_name("Q"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_mutation_without_token() {
        let controller = AuthController::new(MockBackend::default(), MemoryTokenStore::default());
        controller.boot().await.unwrap();

        let err = controller.complete_onboarding().await.unwrap_err();
        assert!(matches!(err, NetError::NotSignedIn));
    }

    #[tokio::test]
    async fn test_watch_applies_initial_result() {
        let u1 = user("Rio");
        let backend = MockBackend::default().reply("abc", Reply::Valid(u1.clone()));
        let controller = AuthController::new(backend, MemoryTokenStore::default());
        controller.sign_in("abc").await.unwrap();

        let mut renamed = u1;
        renamed.name = "Rion".into();
        controller.backend.set("abc", Reply::Valid(renamed.clone()));
        controller.watch().await.unwrap();
        assert_eq!(controller.user(), Some(renamed));

        controller.backend.set("abc", Reply::Invalid);
        controller.watch().await.unwrap();
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        assert_eq!(controller.user(), None);
        assert_eq!(controller.store.load().unwrap(), None);
    }
}
