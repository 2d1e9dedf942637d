//! Session-backed authentication services
//!
//! All services borrow a store and a clock; they hold no state of their
//! own, so callers construct them per request around a locked database.

mod accounts;
mod password;
mod profile;
mod validator;

pub use accounts::{normalize_email, AccountService, MIN_PASSWORD_LEN};
pub use password::{hash_password, verify_password};
pub use profile::ProfileMutator;
pub use validator::{SessionValidator, Validation};
