//! Backend seam for the auth controller

use std::time::Duration;

use async_trait::async_trait;
use platewise_core::{ProfilePatch, PublicUser};
use platewise_net::{Client, ClientEvent, Error, Result};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::controller::AuthController;
use crate::token_store::TokenStore;

/// What the controller needs from the server
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `Ok(None)` is an explicit invalidation; `Err` is a transport failure
    async fn validate(&self, token: &str) -> Result<Option<PublicUser>>;

    /// Delete the server-side session
    async fn revoke(&self, token: &str) -> Result<()>;

    async fn update_profile(&self, token: &str, patch: ProfilePatch) -> Result<()>;

    async fn complete_onboarding(&self, token: &str) -> Result<()>;

    /// Subscribe to live results for `token`, returning the initial one
    async fn watch(&self, token: &str) -> Result<Option<PublicUser>>;
}

#[async_trait]
impl AuthBackend for Client {
    async fn validate(&self, token: &str) -> Result<Option<PublicUser>> {
        Client::validate(self, token).await
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        Client::sign_out(self, token).await
    }

    async fn update_profile(&self, token: &str, patch: ProfilePatch) -> Result<()> {
        Client::update_profile(self, token, patch).await
    }

    async fn complete_onboarding(&self, token: &str) -> Result<()> {
        Client::complete_onboarding(self, token).await
    }

    async fn watch(&self, token: &str) -> Result<Option<PublicUser>> {
        Client::watch(self, token).await
    }
}

/// Server connection opened on first use.
///
/// Local-only operations, sign-out in particular, never wait on the
/// network before touching local state.
pub struct RemoteBackend {
    addr: String,
    timeout: Duration,
    client: OnceCell<Client>,
}

impl RemoteBackend {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            client: OnceCell::new(),
        }
    }

    /// The connected client, connecting now if needed
    pub async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let client = tokio::time::timeout(self.timeout, Client::connect(&self.addr))
                    .await
                    .map_err(|_| Error::Timeout)??;
                Ok::<_, Error>(client.with_timeout(self.timeout))
            })
            .await
    }
}

#[async_trait]
impl AuthBackend for RemoteBackend {
    async fn validate(&self, token: &str) -> Result<Option<PublicUser>> {
        self.client().await?.validate(token).await
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        self.client().await?.sign_out(token).await
    }

    async fn update_profile(&self, token: &str, patch: ProfilePatch) -> Result<()> {
        self.client().await?.update_profile(token, patch).await
    }

    async fn complete_onboarding(&self, token: &str) -> Result<()> {
        self.client().await?.complete_onboarding(token).await
    }

    async fn watch(&self, token: &str) -> Result<Option<PublicUser>> {
        self.client().await?.watch(token).await
    }
}

/// Feed pushed query updates into the controller until the connection drops
pub async fn forward_updates<B, S>(client: &Client, controller: &AuthController<B, S>)
where
    B: AuthBackend,
    S: TokenStore,
{
    while let Some(event) = client.next_event().await {
        match event {
            ClientEvent::QueryUpdate { token, user } => {
                if !controller.apply_update(&token, user) {
                    debug!("Ignored update for a token no longer held");
                }
            }
            ClientEvent::Disconnected => {
                info!("Live updates ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AuthPhase;
    use crate::token_store::SqliteTokenStore;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// An address nothing listens on
    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_lazily() {
        let backend = RemoteBackend::new(dead_addr().await, Duration::from_secs(2));
        assert!(backend.validate("abc").await.is_err());
    }

    #[tokio::test]
    async fn test_sign_out_offline_clears_stored_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.db");
        SqliteTokenStore::open(&path).unwrap().save("abc").unwrap();

        let controller = AuthController::new(
            RemoteBackend::new(dead_addr().await, Duration::from_secs(2)),
            SqliteTokenStore::open(&path).unwrap(),
        );
        controller.sign_out().await;
        assert_eq!(controller.phase(), AuthPhase::Unauthenticated);
        drop(controller);

        let reopened = SqliteTokenStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), None);
    }
}
