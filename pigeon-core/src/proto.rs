//! Pigeon wire protocol: request/response types for the directory and peer links.
//! Encoding is JSON; framing is one message per line (see wire module).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::IdentityRecord;

/// A request to the directory server. One request per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DirectoryRequest {
    /// Bind a username to a reachable address, with an optional free-form profile.
    Register {
        username: String,
        ip: String,
        port: u16,
        #[serde(default)]
        profile: BTreeMap<String, String>,
    },
    /// Look up registered users. `query_type` stays a raw string on the wire so an
    /// unknown kind can be answered with a protocol error instead of a parse failure.
    Query {
        query_type: String,
        #[serde(default)]
        search_term: String,
    },
}

/// A response from the directory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DirectoryResponse {
    Success {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<IdentityRecord>>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        message: String,
    },
}

/// Error code the directory sends when a username is bound to a different address.
pub const ERROR_CODE_USERNAME_TAKEN: &str = "username_taken";

impl DirectoryResponse {
    pub fn success(message: impl Into<String>) -> Self {
        DirectoryResponse::Success {
            message: message.into(),
            users: None,
        }
    }

    pub fn users(users: Vec<IdentityRecord>) -> Self {
        DirectoryResponse::Success {
            message: format!("{} users found", users.len()),
            users: Some(users),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        DirectoryResponse::Error {
            error_code: None,
            message: message.into(),
        }
    }

    pub fn username_taken(username: &str) -> Self {
        DirectoryResponse::Error {
            error_code: Some(ERROR_CODE_USERNAME_TAKEN.to_string()),
            message: format!("Username {username} is already taken"),
        }
    }
}

/// A request on a peer-to-peer connection: handshake first, then messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PeerRequest {
    /// Handshake: identify the dialer and ask to open a session.
    Connect {
        username: String,
        timestamp: DateTime<Utc>,
    },
    /// One chat message. Repeatable after a successful handshake.
    Message {
        from: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

/// Outcome marker shared by peer responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Response to a handshake or message: status, human-readable message, timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerResponse {
    pub status: Status,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PeerResponse {
    pub fn success(message: impl Into<String>) -> Self {
        PeerResponse {
            status: Status::Success,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PeerResponse {
            status: Status::Error,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Opaque per-connection id. Connection bookkeeping is keyed by this, never by
/// the socket handle itself, so a reused handle cannot alias an old session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
