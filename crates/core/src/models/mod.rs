//! Data models for Platewise

mod session;
mod user;

pub use session::*;
pub use user::*;
