//! Platewise client
//!
//! Keeps the signed-in identity of a client process: the persisted token,
//! the current user, and the phase of the session lifecycle.

pub mod backend;
pub mod controller;
pub mod state;
pub mod token_store;

pub use backend::{forward_updates, AuthBackend, RemoteBackend};
pub use controller::AuthController;
pub use state::{AuthPhase, AuthReceiver, AuthSnapshot};
pub use token_store::{MemoryTokenStore, SqliteTokenStore, TokenStore, AUTH_TOKEN_KEY};
