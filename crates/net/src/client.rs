//! TCP client for the auth server
//!
//! Requests are correlated to replies by `request_id`. A reader task routes
//! replies to the waiting caller and forwards pushed query updates to the
//! event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use platewise_core::{ProfilePatch, PublicUser};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Request, Response};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Unsolicited event from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Fresh result for a watched token; `None` means the token is no longer valid
    QueryUpdate {
        token: String,
        user: Option<PublicUser>,
    },
    /// Connection lost
    Disconnected,
}

/// A session returned by sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIn {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Client handle for network operations
pub struct Client {
    pending: Pending,
    out_tx: mpsc::Sender<Request>,
    event_rx: Mutex<mpsc::Receiver<ClientEvent>>,
    next_request_id: AtomicU64,
    timeout: Duration,
}

impl Client {
    /// Connect to an auth server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        info!(addr = %peer, "Connected to server");

        let (reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, out_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(writer_task(writer, out_rx));
        tokio::spawn(reader_task(reader, pending.clone(), event_tx));

        Ok(Client {
            pending,
            out_tx,
            event_rx: Mutex::new(event_rx),
            next_request_id: AtomicU64::new(1),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the next pushed event
    pub async fn next_event(&self) -> Option<ClientEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Send a request and wait for its reply
    async fn request(&self, build: impl FnOnce(u64) -> Request) -> Result<Response> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if self.out_tx.send(build(request_id)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(Error::NotConnected);
        }

        let response = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(request_id, "Request timed out");
                return Err(Error::Timeout);
            }
        };

        match response {
            Response::Error { kind, message, .. } => Err(Error::Remote { kind, message }),
            other => Ok(other),
        }
    }

    /// Resolve a token; `None` is the server's explicit invalid signal
    pub async fn validate(&self, token: &str) -> Result<Option<PublicUser>> {
        let token = token.to_string();
        match self
            .request(|request_id| Request::Validate { request_id, token })
            .await?
        {
            Response::User { user, .. } => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    /// Apply a sparse profile patch
    pub async fn update_profile(&self, token: &str, patch: ProfilePatch) -> Result<()> {
        let token = token.to_string();
        let response = self
            .request(|request_id| Request::update_profile(request_id, token, patch))
            .await?;
        expect_ack(response)
    }

    /// Mark onboarding as done
    pub async fn complete_onboarding(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        let response = self
            .request(|request_id| Request::CompleteOnboarding { request_id, token })
            .await?;
        expect_ack(response)
    }

    /// Register an account
    pub async fn sign_up(&self, email: &str, name: &str, password: &str) -> Result<PublicUser> {
        let (email, name, password) = (email.to_string(), name.to_string(), password.to_string());
        match self
            .request(|request_id| Request::SignUp {
                request_id,
                email,
                name,
                password,
            })
            .await?
        {
            Response::User {
                user: Some(user), ..
            } => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    /// Exchange credentials for a session token
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn> {
        let (email, password) = (email.to_string(), password.to_string());
        match self
            .request(|request_id| Request::SignIn {
                request_id,
                email,
                password,
            })
            .await?
        {
            Response::Session {
                token, expires_at, ..
            } => Ok(SignedIn { token, expires_at }),
            other => Err(unexpected(&other)),
        }
    }

    /// Delete the session behind `token`
    pub async fn sign_out(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        let response = self
            .request(|request_id| Request::SignOut { request_id, token })
            .await?;
        expect_ack(response)
    }

    /// Subscribe to live results for `token`, returning the initial result
    pub async fn watch(&self, token: &str) -> Result<Option<PublicUser>> {
        let token = token.to_string();
        match self
            .request(|request_id| Request::Watch { request_id, token })
            .await?
        {
            Response::User { user, .. } => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    /// Drop a subscription
    pub async fn unwatch(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        let response = self
            .request(|request_id| Request::Unwatch { request_id, token })
            .await?;
        expect_ack(response)
    }

    /// Round-trip a ping
    pub async fn ping(&self) -> Result<()> {
        match self.request(|request_id| Request::Ping { request_id }).await? {
            Response::Pong { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn expect_ack(response: Response) -> Result<()> {
    match response {
        Response::Ack { success: true, .. } => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol(format!("Unexpected reply: {:?}", response))
}

/// Writer task - sends requests to the server
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &request).await {
            warn!(error = %e, "Write error");
            break;
        }
    }
}

/// Reader task - routes replies and pushed updates
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    pending: Pending,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Response::QueryUpdate { token, user }) => {
                let _ = event_tx.send(ClientEvent::QueryUpdate { token, user }).await;
            }
            Ok(response) => {
                let Some(request_id) = response.request_id() else {
                    continue;
                };
                match pending.lock().await.remove(&request_id) {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(response);
                    }
                    None => debug!(request_id, "Reply for unknown or timed-out request"),
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!("Server closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                break;
            }
        }
    }

    // Cleanup: waiting callers see ConnectionClosed
    pending.lock().await.clear();
    let _ = event_tx.send(ClientEvent::Disconnected).await;
    info!("Disconnected from server");
}
