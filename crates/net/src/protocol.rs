//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Requests carry a client-chosen `request_id` which the reply echoes.

use chrono::{DateTime, Utc};
use platewise_core::{ProfilePatch, PublicUser};
use serde::{Deserialize, Serialize};

/// Error classes carried in an `Error` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    Unavailable,
    InvalidInput,
    Conflict,
    Authentication,
}

impl From<&platewise_core::Error> for ErrorKind {
    fn from(e: &platewise_core::Error) -> Self {
        use platewise_core::Error as E;
        match e {
            E::Unauthorized => ErrorKind::Unauthorized,
            E::NotFound(_) => ErrorKind::NotFound,
            E::InvalidInput(_) => ErrorKind::InvalidInput,
            E::Conflict(_) => ErrorKind::Conflict,
            E::Authentication(_) => ErrorKind::Authentication,
            E::Database(_) | E::Io(_) | E::PasswordHash(_) | E::Config(_) => {
                ErrorKind::Unavailable
            }
        }
    }
}

/// Client → server requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Resolve a token to its user
    Validate { request_id: u64, token: String },

    /// Apply a sparse profile patch for the token's owner
    UpdateProfile {
        request_id: u64,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(
            default,
            rename = "dailyCalorieGoal",
            skip_serializing_if = "Option::is_none"
        )]
        daily_calorie_goal: Option<u32>,
    },

    /// Mark onboarding as done for the token's owner
    CompleteOnboarding { request_id: u64, token: String },

    /// Register an account
    SignUp {
        request_id: u64,
        email: String,
        name: String,
        password: String,
    },

    /// Exchange credentials for a session
    SignIn {
        request_id: u64,
        email: String,
        password: String,
    },

    /// Delete the token's session
    SignOut { request_id: u64, token: String },

    /// Subscribe to live validation results for a token
    Watch { request_id: u64, token: String },

    /// Drop a subscription
    Unwatch { request_id: u64, token: String },

    /// Keepalive
    Ping { request_id: u64 },
}

impl Request {
    pub fn update_profile(request_id: u64, token: String, patch: ProfilePatch) -> Self {
        Request::UpdateProfile {
            request_id,
            token,
            name: patch.name,
            daily_calorie_goal: patch.daily_calorie_goal,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Request::Validate { request_id, .. }
            | Request::UpdateProfile { request_id, .. }
            | Request::CompleteOnboarding { request_id, .. }
            | Request::SignUp { request_id, .. }
            | Request::SignIn { request_id, .. }
            | Request::SignOut { request_id, .. }
            | Request::Watch { request_id, .. }
            | Request::Unwatch { request_id, .. }
            | Request::Ping { request_id } => *request_id,
        }
    }
}

/// Server → client replies and pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Validation result: `None` is the explicit invalid signal
    User {
        request_id: u64,
        user: Option<PublicUser>,
    },

    /// Mutation acknowledged
    Ack { request_id: u64, success: bool },

    /// New session from sign-in
    Session {
        request_id: u64,
        token: String,
        expires_at: DateTime<Utc>,
    },

    /// Request failed
    Error {
        request_id: u64,
        kind: ErrorKind,
        message: String,
    },

    /// Keepalive reply
    Pong { request_id: u64 },

    /// Fresh result for a watched token
    QueryUpdate {
        token: String,
        user: Option<PublicUser>,
    },
}

impl Response {
    /// The request this replies to, `None` for unsolicited pushes
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Response::User { request_id, .. }
            | Response::Ack { request_id, .. }
            | Response::Session { request_id, .. }
            | Response::Error { request_id, .. }
            | Response::Pong { request_id } => Some(*request_id),
            Response::QueryUpdate { .. } => None,
        }
    }

    pub fn error(request_id: u64, e: &platewise_core::Error) -> Self {
        Response::Error {
            request_id,
            kind: ErrorKind::from(e),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_profile_wire_shape() {
        let json = r#"{"type":"UpdateProfile","request_id":7,"token":"t","dailyCalorieGoal":0}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        match req {
            Request::UpdateProfile {
                request_id,
                name,
                daily_calorie_goal,
                ..
            } => {
                assert_eq!(request_id, 7);
                assert_eq!(name, None);
                assert_eq!(daily_calorie_goal, Some(0));
            }
            other => panic!("Wrong request type: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_signal_is_explicit_null() {
        let resp = Response::User {
            request_id: 1,
            user: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""user":null"#));
        assert_eq!(resp.request_id(), Some(1));
    }

    #[test]
    fn test_error_kind_mapping() {
        let kind = ErrorKind::from(&platewise_core::Error::Unauthorized);
        assert_eq!(kind, ErrorKind::Unauthorized);

        let infra = platewise_core::Error::Io(std::io::Error::other("disk"));
        assert_eq!(ErrorKind::from(&infra), ErrorKind::Unavailable);
    }
}
