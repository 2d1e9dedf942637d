//! Platewise Core Library
//!
//! Models, storage, and the session-backed authentication services for
//! the Platewise backend and client.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use auth::{AccountService, ProfileMutator, SessionValidator, Validation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use models::*;
pub use storage::{Database, KeyValueStore, SessionRepository, Storage, UserRepository};
