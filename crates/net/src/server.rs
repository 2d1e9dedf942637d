//! TCP server exposing the auth services
//!
//! Each connection gets a reader loop and a writer task. Requests run
//! against one shared database on the blocking pool, so writes to a user
//! record are serialized. Connections may watch tokens; watchers receive
//! a fresh `QueryUpdate` whenever the result for their token may change.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use platewise_core::auth::{AccountService, ProfileMutator, SessionValidator};
use platewise_core::models::redact;
use platewise_core::{Clock, Database, ProfilePatch};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_payload, write_frame};
use crate::protocol::{ErrorKind, Request, Response};

/// Outbound queue depth per connection
const OUTBOUND_QUEUE: usize = 64;

/// Runtime knobs for the server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub session_ttl: Duration,
    /// Expired-session sweep period, `None` to disable
    pub sweep_interval: Option<std::time::Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            session_ttl: Duration::days(30),
            sweep_interval: Some(std::time::Duration::from_secs(15 * 60)),
        }
    }
}

/// A connection's live queries
struct Watcher {
    tx: mpsc::Sender<Response>,
    /// Watched token → owner at the last delivered result
    tokens: HashMap<String, Option<Uuid>>,
}

/// Server state shared across tasks
struct ServerState {
    db: Mutex<Database>,
    clock: Arc<dyn Clock>,
    options: ServerOptions,
    watchers: RwLock<HashMap<u64, Watcher>>,
    next_conn_id: AtomicU64,
}

/// Auth server handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start serving
    pub async fn start<A: ToSocketAddrs>(
        listen_addr: A,
        db: Database,
        clock: Arc<dyn Clock>,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweep_interval = options.sweep_interval;

        let state = Arc::new(ServerState {
            db: Mutex::new(db),
            clock,
            options,
            watchers: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(
            listener,
            state.clone(),
            shutdown_tx.subscribe(),
        ));

        if let Some(interval) = sweep_interval {
            tokio::spawn(sweep_task(state.clone(), interval, shutdown_tx.subscribe()));
        }

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run one expired-session sweep now
    pub async fn sweep_expired(&self) -> Result<u64> {
        sweep_once(&self.state).await
    }

    /// Number of connections currently holding live queries
    pub async fn watcher_count(&self) -> usize {
        self.state
            .watchers
            .read()
            .await
            .values()
            .filter(|w| !w.tokens.is_empty())
            .count()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Run a storage operation on the blocking pool under the database lock
async fn with_db<T, F>(state: &Arc<ServerState>, f: F) -> platewise_core::Result<T>
where
    F: FnOnce(&Database, &dyn Clock) -> platewise_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || {
        let db = state.db.blocking_lock();
        f(&db, state.clock.as_ref())
    })
    .await
    .map_err(|e| platewise_core::Error::Io(std::io::Error::other(e)))?
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(stream, addr, state.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    let (mut reader, writer) = tokio::io::split(stream);
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    state.watchers.write().await.insert(
        conn_id,
        Watcher {
            tx: tx.clone(),
            tokens: HashMap::new(),
        },
    );

    let writer_handle = tokio::spawn(writer_task(writer, rx));

    loop {
        match read_payload(&mut reader).await {
            Ok(payload) => {
                let response = match decode_request(&payload) {
                    Decoded::Request(request) => handle_request(request, conn_id, &state).await,
                    Decoded::Rejected(reply) => reply,
                    Decoded::Garbage(reason) => {
                        warn!(addr = %addr, reason = %reason, "Undecodable frame");
                        break;
                    }
                };
                if tx.send(response).await.is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!(conn_id, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Read error");
                break;
            }
        }
    }

    // Cleanup
    state.watchers.write().await.remove(&conn_id);
    drop(tx);
    if let Err(e) = writer_handle.await {
        debug!(error = %e, "Writer task ended abnormally");
    }
    debug!(addr = %addr, conn_id, "Client disconnected");
}

/// Writer task - sends responses to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Response>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

enum Decoded {
    Request(Request),
    /// Well-formed JSON that is not a valid request, answered in place
    Rejected(Response),
    /// Not JSON, or no request id to answer to
    Garbage(String),
}

fn decode_request(payload: &[u8]) -> Decoded {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => return Decoded::Garbage(format!("Invalid JSON: {e}")),
    };
    let request_id = value.get("request_id").and_then(|id| id.as_u64());

    match serde_json::from_value::<Request>(value) {
        Ok(request) => Decoded::Request(request),
        Err(e) => match request_id {
            Some(request_id) => {
                debug!(request_id, error = %e, "Malformed request");
                Decoded::Rejected(Response::Error {
                    request_id,
                    kind: ErrorKind::InvalidInput,
                    message: format!("Malformed request: {e}"),
                })
            }
            None => Decoded::Garbage(format!("Malformed request: {e}")),
        },
    }
}

fn error_reply(request_id: u64, e: &platewise_core::Error) -> Response {
    match e {
        platewise_core::Error::Unauthorized => debug!(request_id, "Unauthorized request"),
        e if e.is_infra() => warn!(request_id, error = %e, "Storage failure"),
        e => debug!(request_id, error = %e, "Request rejected"),
    }
    Response::error(request_id, e)
}

/// Dispatch one request
async fn handle_request(request: Request, conn_id: u64, state: &Arc<ServerState>) -> Response {
    let request_id = request.request_id();

    match request {
        Request::Validate { token, .. } => {
            let result = with_db(state, move |db, clock| {
                SessionValidator::new(db, clock).validate(&token)
            })
            .await;
            match result {
                Ok(validation) => Response::User {
                    request_id,
                    user: validation.into_user(),
                },
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::UpdateProfile {
            token,
            name,
            daily_calorie_goal,
            ..
        } => {
            let patch = ProfilePatch {
                name,
                daily_calorie_goal,
            };
            let result = with_db(state, move |db, clock| {
                ProfileMutator::new(db, clock).update_profile(&token, &patch)?;
                owner_of(db, clock, &token)
            })
            .await;
            match result {
                Ok(owner) => {
                    if let Some(user_id) = owner {
                        notify_owner(state, user_id).await;
                    }
                    Response::Ack {
                        request_id,
                        success: true,
                    }
                }
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::CompleteOnboarding { token, .. } => {
            let result = with_db(state, move |db, clock| {
                ProfileMutator::new(db, clock).complete_onboarding(&token)?;
                owner_of(db, clock, &token)
            })
            .await;
            match result {
                Ok(owner) => {
                    if let Some(user_id) = owner {
                        notify_owner(state, user_id).await;
                    }
                    Response::Ack {
                        request_id,
                        success: true,
                    }
                }
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::SignUp {
            email,
            name,
            password,
            ..
        } => {
            let ttl = state.options.session_ttl;
            let result = with_db(state, move |db, clock| {
                AccountService::new(db, clock, ttl).sign_up(&email, &name, &password)
            })
            .await;
            match result {
                Ok(user) => Response::User {
                    request_id,
                    user: Some(user),
                },
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::SignIn {
            email, password, ..
        } => {
            let ttl = state.options.session_ttl;
            let result = with_db(state, move |db, clock| {
                AccountService::new(db, clock, ttl).sign_in(&email, &password)
            })
            .await;
            match result {
                Ok(session) => Response::Session {
                    request_id,
                    token: session.token.as_str().to_string(),
                    expires_at: session.expires_at,
                },
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::SignOut { token, .. } => {
            let ttl = state.options.session_ttl;
            let revoked = token.clone();
            let result = with_db(state, move |db, clock| {
                AccountService::new(db, clock, ttl).sign_out(&token)
            })
            .await;
            match result {
                Ok(()) => {
                    notify_revoked(state, &revoked).await;
                    Response::Ack {
                        request_id,
                        success: true,
                    }
                }
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::Watch { token, .. } => {
            let watched = token.clone();
            let shared = state.clone();
            // Register under the database lock so no mutation slips in
            // between the initial result and the subscription
            let result = with_db(state, move |db, clock| {
                let user = SessionValidator::new(db, clock)
                    .validate(&watched)?
                    .into_user();
                if let Some(watcher) = shared.watchers.blocking_write().get_mut(&conn_id) {
                    watcher
                        .tokens
                        .insert(watched, user.as_ref().map(|u| u.id));
                }
                Ok(user)
            })
            .await;
            match result {
                Ok(user) => {
                    debug!(conn_id, token = %redact(&token), "Watching token");
                    Response::User { request_id, user }
                }
                Err(e) => error_reply(request_id, &e),
            }
        }

        Request::Unwatch { token, .. } => {
            if let Some(watcher) = state.watchers.write().await.get_mut(&conn_id) {
                watcher.tokens.remove(&token);
            }
            Response::Ack {
                request_id,
                success: true,
            }
        }

        Request::Ping { .. } => Response::Pong { request_id },
    }
}

/// Owner of a live token, used to fan out updates after a mutation
fn owner_of(
    db: &Database,
    clock: &dyn Clock,
    token: &str,
) -> platewise_core::Result<Option<Uuid>> {
    Ok(SessionValidator::new(db, clock)
        .validate(token)?
        .into_user()
        .map(|u| u.id))
}

/// Re-run watched queries whose last result belonged to `user_id`
async fn notify_owner(state: &Arc<ServerState>, user_id: Uuid) {
    refresh_watchers(state, |_, owner| owner == Some(user_id), true).await;
}

/// Tell watchers of a signed-out token that it is gone
async fn notify_revoked(state: &Arc<ServerState>, token: &str) {
    refresh_watchers(state, |t, _| t == token, true).await;
}

/// Re-validate the watched tokens selected by `affected` and push results.
///
/// Unless `always_push` is set, a result is pushed only when the owner
/// differs from the last one delivered.
async fn refresh_watchers<F>(state: &Arc<ServerState>, affected: F, always_push: bool)
where
    F: Fn(&str, Option<Uuid>) -> bool,
{
    let tokens: Vec<String> = {
        let watchers = state.watchers.read().await;
        let mut tokens: Vec<String> = watchers
            .values()
            .flat_map(|w| w.tokens.iter())
            .filter(|(token, owner)| affected(token, **owner))
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    };
    if tokens.is_empty() {
        return;
    }

    let results = with_db(state, move |db, clock| {
        let validator = SessionValidator::new(db, clock);
        let mut results = HashMap::new();
        for token in tokens {
            match validator.validate(&token) {
                Ok(validation) => {
                    results.insert(token, validation.into_user());
                }
                Err(e) => warn!(token = %redact(&token), error = %e, "Watch refresh failed"),
            }
        }
        Ok(results)
    })
    .await;

    let results = match results {
        Ok(results) => results,
        Err(e) => {
            warn!(error = %e, "Watch refresh failed");
            return;
        }
    };

    let mut watchers = state.watchers.write().await;
    for (conn_id, watcher) in watchers.iter_mut() {
        for (token, last_owner) in watcher.tokens.iter_mut() {
            let Some(user) = results.get(token) else {
                continue;
            };
            let owner = user.as_ref().map(|u| u.id);
            if !always_push && owner == *last_owner {
                continue;
            }
            *last_owner = owner;

            let update = Response::QueryUpdate {
                token: token.clone(),
                user: user.clone(),
            };
            if watcher.tx.try_send(update).is_err() {
                debug!(conn_id, "Dropped query update for slow or closed connection");
            }
        }
    }
}

/// Purge expired sessions and notify watchers whose token lapsed
async fn sweep_once(state: &Arc<ServerState>) -> Result<u64> {
    let ttl = state.options.session_ttl;
    let purged = with_db(state, move |db, clock| {
        AccountService::new(db, clock, ttl).purge_expired_sessions()
    })
    .await?;

    refresh_watchers(state, |_, owner| owner.is_some(), false).await;
    Ok(purged)
}

/// Periodic expired-session sweep
async fn sweep_task(
    state: Arc<ServerState>,
    interval: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = sweep_once(&state).await {
                    warn!(error = %e, "Session sweep failed");
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Sweep task shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platewise_core::SystemClock;

    #[tokio::test]
    async fn test_server_start() {
        let server = Server::start(
            "127.0.0.1:0",
            Database::open_in_memory().unwrap(),
            Arc::new(SystemClock),
            ServerOptions::default(),
        )
        .await
        .unwrap();

        assert!(server.addr().port() > 0);
        assert_eq!(server.sweep_expired().await.unwrap(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let server = Server::start(
            "127.0.0.1:0",
            Database::open_in_memory().unwrap(),
            Arc::new(SystemClock),
            ServerOptions::default(),
        )
        .await
        .unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();

        let bad = serde_json::json!({
            "type": "UpdateProfile",
            "request_id": 7,
            "token": "abc",
            "dailyCalorieGoal": -5,
        });
        write_frame(&mut stream, &bad).await.unwrap();
        let reply: Response = crate::frame::read_frame(&mut stream).await.unwrap();
        assert!(matches!(
            reply,
            Response::Error {
                request_id: 7,
                kind: ErrorKind::InvalidInput,
                ..
            }
        ));

        write_frame(&mut stream, &Request::Ping { request_id: 8 })
            .await
            .unwrap();
        let reply: Response = crate::frame::read_frame(&mut stream).await.unwrap();
        assert_eq!(reply, Response::Pong { request_id: 8 });

        server.shutdown();
    }

    #[test]
    fn test_decode_without_request_id_is_garbage() {
        assert!(matches!(
            decode_request(br#"{"type":"Ping"}"#),
            Decoded::Garbage(_)
        ));
        assert!(matches!(decode_request(b"not json"), Decoded::Garbage(_)));
        assert!(matches!(
            decode_request(br#"{"type":"Ping","request_id":1}"#),
            Decoded::Request(Request::Ping { request_id: 1 })
        ));
    }
}
