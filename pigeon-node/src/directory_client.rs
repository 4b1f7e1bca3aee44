//! Client side of the directory protocol: one request per connection, 5s
//! timeout on the whole round trip.

use std::collections::BTreeMap;
use std::time::Duration;

use pigeon_core::{
    DirectoryRequest, DirectoryResponse, IdentityRecord, QueryKind, WireError,
    ERROR_CODE_USERNAME_TAKEN,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DirectoryClientError {
    #[error("directory request timed out")]
    Timeout,
    #[error("io error talking to directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("username {0} is already taken")]
    UsernameTaken(String),
    #[error("directory rejected request: {0}")]
    Rejected(String),
    #[error("directory closed the connection without responding")]
    ClosedEarly,
}

/// Thin handle on the directory server's address. Connections are per-request,
/// so the handle is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    host: String,
    port: u16,
}

impl DirectoryClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Bind `username` to `ip:port` in the directory.
    pub async fn register(
        &self,
        username: &str,
        ip: &str,
        port: u16,
        profile: BTreeMap<String, String>,
    ) -> Result<(), DirectoryClientError> {
        let req = DirectoryRequest::Register {
            username: username.to_string(),
            ip: ip.to_string(),
            port,
            profile,
        };
        match self.round_trip(&req).await? {
            DirectoryResponse::Success { .. } => Ok(()),
            DirectoryResponse::Error {
                error_code,
                message,
            } => {
                if error_code.as_deref() == Some(ERROR_CODE_USERNAME_TAKEN) {
                    Err(DirectoryClientError::UsernameTaken(username.to_string()))
                } else {
                    Err(DirectoryClientError::Rejected(message))
                }
            }
        }
    }

    /// Look up registered users. An empty result set is a successful response,
    /// not an error.
    pub async fn query(
        &self,
        kind: QueryKind,
        term: &str,
    ) -> Result<Vec<IdentityRecord>, DirectoryClientError> {
        let req = DirectoryRequest::Query {
            query_type: kind.as_str().to_string(),
            search_term: term.to_string(),
        };
        match self.round_trip(&req).await? {
            DirectoryResponse::Success { users, .. } => Ok(users.unwrap_or_default()),
            DirectoryResponse::Error { message, .. } => Err(DirectoryClientError::Rejected(message)),
        }
    }

    async fn round_trip(
        &self,
        req: &DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryClientError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.round_trip_inner(req))
            .await
            .map_err(|_| DirectoryClientError::Timeout)?
    }

    async fn round_trip_inner(
        &self,
        req: &DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryClientError> {
        let stream = TcpStream::connect(self.addr()).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half.write_all(&pigeon_core::encode_line(req)?).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(DirectoryClientError::ClosedEarly);
        }
        Ok(pigeon_core::decode_line(&line)?)
    }
}

/// Address this host is reachable at, discovered by opening a UDP socket
/// towards a public address and reading the local endpoint. No packet is sent.
/// Falls back to loopback when the host has no route out.
pub fn reachable_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!(error = %e, "external ip probe failed, using loopback");
            "127.0.0.1".to_string()
        }
    }
}
