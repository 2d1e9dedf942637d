//! Client auth state
//!
//! `AuthState` is the controller's private record, token included.
//! UI code only ever sees `AuthSnapshot`.

use platewise_core::PublicUser;
use tokio::sync::watch;

/// Lifecycle phase of the client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Process started, stored token not yet checked
    Booting,
    Unauthenticated,
    /// A validation request is outstanding
    Authenticating,
    Authenticated,
}

/// What the UI may read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub phase: AuthPhase,
    pub user: Option<PublicUser>,
    pub loading: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthState {
    pub phase: AuthPhase,
    pub token: Option<String>,
    pub user: Option<PublicUser>,
    pub loading: bool,
    /// Bumped whenever the token identity changes
    pub epoch: u64,
    pub boot_started: bool,
}

impl AuthState {
    pub fn initial() -> Self {
        Self {
            phase: AuthPhase::Booting,
            token: None,
            user: None,
            loading: true,
            epoch: 0,
            boot_started: false,
        }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            phase: self.phase,
            user: self.user.clone(),
            loading: self.loading,
        }
    }

    /// True when `token` is the one currently held
    pub fn holds(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }
}

/// Change feed for UI code
pub struct AuthReceiver {
    rx: watch::Receiver<AuthState>,
}

impl AuthReceiver {
    pub(crate) fn new(rx: watch::Receiver<AuthState>) -> Self {
        Self { rx }
    }

    /// Wait for the next state change; false once the controller is gone
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.rx.borrow().snapshot()
    }
}
