//! Platewise Network Library
//!
//! TCP transport for the session-backed auth services.
//!
//! # Architecture
//!
//! - **Server**: owns the database, answers requests, pushes live query updates
//! - **Client**: request/reply correlation plus a stream of pushed events
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start("127.0.0.1:7440", db, Arc::new(SystemClock), ServerOptions::default()).await?;
//!
//! let client = Client::connect(server.addr()).await?;
//! let session = client.sign_in("me@example.com", "password").await?;
//! let user = client.watch(&session.token).await?;
//!
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ClientEvent::QueryUpdate { user, .. } => { /* re-render */ }
//!         ClientEvent::Disconnected => break,
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientEvent, SignedIn};
pub use error::{Error, Result};
pub use protocol::{ErrorKind, Request, Response};
pub use server::{Server, ServerOptions};

/// Default port for Platewise servers
pub const DEFAULT_PORT: u16 = 7440;
