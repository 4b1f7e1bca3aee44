//! Directory server: one request, one response, per connection.
//!
//! Every accepted connection gets its own worker task. All registry reads and
//! writes, including the snapshot write, happen under one mutex, so the file
//! on disk is never observed half-updated.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pigeon_core::registry::{RegisterError, RegistryStore, SnapshotError};
use pigeon_core::{DirectoryRequest, DirectoryResponse, QueryKind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::eventlog::EventLog;

/// How long a worker waits for the single request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry plus its snapshot path, guarded together: whoever holds the lock
/// may mutate the maps and write the file as one step.
struct RegistryState {
    store: RegistryStore,
    snapshot_path: PathBuf,
}

impl RegistryState {
    /// Best-effort persistence: a failed write is logged and the in-memory
    /// state stays authoritative.
    fn persist(&self, events: &EventLog) {
        match self.store.save(&self.snapshot_path) {
            Ok(()) => events.record(
                "REGISTRY_SAVED",
                &format!("Saved registry with {} users", self.store.len()),
            ),
            Err(e) => {
                tracing::warn!("registry snapshot write failed: {e}");
                events.record("REGISTRY_SAVE_ERROR", &format!("Error saving registry: {e}"));
            }
        }
    }
}

struct Shared {
    registry: Mutex<RegistryState>,
    events: EventLog,
}

/// A bound directory server, ready to run.
pub struct DirectoryServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl DirectoryServer {
    /// Bind the listen socket, open the event log, and load any existing
    /// snapshot. A corrupt snapshot is logged and replaced by an empty store.
    pub async fn bind(cfg: &Config) -> anyhow::Result<Self> {
        let events = EventLog::create(&cfg.data_dir)?;
        let snapshot_path = cfg.snapshot_path();
        let store = match RegistryStore::load(&snapshot_path) {
            Ok(store) => {
                if store.is_empty() {
                    events.record("REGISTRY_EMPTY", "No existing registry found, starting empty");
                } else {
                    events.record(
                        "REGISTRY_LOADED",
                        &format!("Loaded registry with {} users", store.len()),
                    );
                }
                store
            }
            Err(e) => {
                tracing::warn!("registry snapshot load failed: {e}");
                events.record("REGISTRY_LOAD_ERROR", &format!("Error loading registry: {e}"));
                RegistryStore::new()
            }
        };

        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        let local = listener.local_addr()?;
        tracing::info!("directory server listening on {local}");
        events.record("SERVER_START", &format!("Directory server started on {local}"));

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry: Mutex::new(RegistryState {
                    store,
                    snapshot_path,
                }),
                events,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. On shutdown: stop accepting, let in-flight workers finish,
    /// persist the registry one final time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.shared
                            .events
                            .record("NEW_CONNECTION", &format!("New connection from {addr}"));
                        let shared = self.shared.clone();
                        workers.spawn(async move {
                            if let Err(e) = handle_client(stream, addr, &shared).await {
                                tracing::debug!("client {addr}: {e}");
                                shared.events.record(
                                    "CLIENT_ERROR",
                                    &format!("Error handling client {addr}: {e}"),
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {e}");
                        self.shared
                            .events
                            .record("ACCEPT_ERROR", &format!("Error accepting connection: {e}"));
                    }
                },
            }
            // Reap finished workers so the set does not grow unbounded.
            while workers.try_join_next().is_some() {}
        }

        drop(self.listener);
        self.shared
            .events
            .record("SHUTDOWN", "Stopped accepting, draining workers");
        while workers.join_next().await.is_some() {}

        let registry = self.shared.registry.lock().await;
        registry.persist(&self.shared.events);
        self.shared
            .events
            .record("SERVER_SHUTDOWN", "Directory server shut down");
        tracing::info!("directory server shut down");
        Ok(())
    }
}

/// Errors a worker can hit. All of them terminate only that connection.
#[derive(Debug, thiserror::Error)]
enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out")]
    Timeout,
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    shared: &Shared,
) -> Result<(), ClientError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let n = tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| ClientError::Timeout)??;
    let response = if n == 0 {
        // Peer closed without sending anything; nothing to answer.
        return Ok(());
    } else {
        match pigeon_core::decode_line::<DirectoryRequest>(&line) {
            Ok(request) => process_request(request, addr, shared).await,
            Err(e) => {
                tracing::debug!("malformed request from {addr}: {e}");
                DirectoryResponse::error("Invalid action")
            }
        }
    };

    let bytes = pigeon_core::encode_line(&response).map_err(std::io::Error::other)?;
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;
    let status = match &response {
        DirectoryResponse::Success { .. } => "success",
        DirectoryResponse::Error { .. } => "error",
    };
    shared
        .events
        .record("RESPONSE_SENT", &format!("To {addr}: {status}"));
    Ok(())
}

async fn process_request(
    request: DirectoryRequest,
    addr: SocketAddr,
    shared: &Shared,
) -> DirectoryResponse {
    match request {
        DirectoryRequest::Register {
            username,
            ip,
            port,
            profile,
        } => {
            shared
                .events
                .record("REQUEST_RECEIVED", &format!("From {addr}: register"));
            if username.is_empty() || ip.is_empty() {
                return DirectoryResponse::error("Missing required fields");
            }
            let mut registry = shared.registry.lock().await;
            match registry.store.register(&username, &ip, port, profile, Utc::now()) {
                Ok(()) => {
                    registry.persist(&shared.events);
                    shared.events.record(
                        "USER_REGISTERED",
                        &format!("User {username} registered at {ip}:{port}"),
                    );
                    DirectoryResponse::success(format!("User {username} registered successfully"))
                }
                Err(RegisterError::UsernameTaken(name)) => {
                    shared
                        .events
                        .record("USERNAME_CONFLICT", &format!("Username {name} already taken"));
                    DirectoryResponse::username_taken(&name)
                }
            }
        }
        DirectoryRequest::Query {
            query_type,
            search_term,
        } => {
            shared
                .events
                .record("REQUEST_RECEIVED", &format!("From {addr}: query"));
            let Some(kind) = QueryKind::parse(&query_type) else {
                return DirectoryResponse::error("Invalid query type");
            };
            let registry = shared.registry.lock().await;
            // Requester name is known only if they registered from this exact
            // address; used for the audit line, nothing else.
            let requester = registry
                .store
                .username_for_addr(&addr.to_string())
                .unwrap_or("unknown")
                .to_string();
            let users = registry.store.query(kind, &search_term);
            drop(registry);
            shared.events.record(
                "USER_QUERY",
                &format!("Query from {requester}: {query_type} - {search_term}"),
            );
            shared
                .events
                .record("QUERY_RESULTS", &format!("Query results: {} users found", users.len()));
            DirectoryResponse::users(users)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: dir.to_path_buf(),
        }
    }

    async fn start(cfg: &Config) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let server = DirectoryServer::bind(cfg).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            server.run(rx).await.unwrap();
        });
        (addr, tx, task)
    }

    async fn send(addr: SocketAddr, request: &DirectoryRequest) -> DirectoryResponse {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&pigeon_core::encode_line(request).unwrap())
            .await
            .unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        pigeon_core::decode_line(&line).unwrap()
    }

    fn register_req(username: &str, ip: &str, port: u16) -> DirectoryRequest {
        DirectoryRequest::Register {
            username: username.into(),
            ip: ip.into(),
            port,
            profile: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn register_then_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown, task) = start(&test_config(dir.path())).await;

        let resp = send(addr, &register_req("alice", "127.0.0.1", 9001)).await;
        assert!(matches!(resp, DirectoryResponse::Success { .. }));

        let resp = send(
            addr,
            &DirectoryRequest::Query {
                query_type: "name".into(),
                search_term: "alice".into(),
            },
        )
        .await;
        match resp {
            DirectoryResponse::Success { users: Some(users), .. } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].username, "alice");
                assert_eq!(users[0].port, 9001);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_registration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown, task) = start(&test_config(dir.path())).await;

        let resp = send(addr, &register_req("alice", "127.0.0.1", 9001)).await;
        assert!(matches!(resp, DirectoryResponse::Success { .. }));

        // Same name, different address.
        let resp = send(addr, &register_req("alice", "10.0.0.2", 9001)).await;
        match resp {
            DirectoryResponse::Error { error_code, .. } => {
                assert_eq!(error_code.as_deref(), Some("username_taken"));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Same name, same address: update in place.
        let resp = send(addr, &register_req("alice", "127.0.0.1", 9001)).await;
        assert!(matches!(resp, DirectoryResponse::Success { .. }));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_query_type_and_action() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown, task) = start(&test_config(dir.path())).await;

        let resp = send(
            addr,
            &DirectoryRequest::Query {
                query_type: "bogus".into(),
                search_term: String::new(),
            },
        )
        .await;
        match resp {
            DirectoryResponse::Error { message, error_code } => {
                assert_eq!(message, "Invalid query type");
                assert!(error_code.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Raw unknown action.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"{\"action\":\"dance\"}\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let resp: DirectoryResponse = pigeon_core::decode_line(&line).unwrap();
        assert!(matches!(resp, DirectoryResponse::Error { .. }));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let (addr, shutdown, task) = start(&cfg).await;
        let resp = send(addr, &register_req("alice", "127.0.0.1", 9001)).await;
        assert!(matches!(resp, DirectoryResponse::Success { .. }));
        shutdown.send(true).unwrap();
        task.await.unwrap();

        // Fresh server over the same data dir sees alice without re-registration.
        let (addr, shutdown, task) = start(&cfg).await;
        let resp = send(
            addr,
            &DirectoryRequest::Query {
                query_type: "all".into(),
                search_term: String::new(),
            },
        )
        .await;
        match resp {
            DirectoryResponse::Success { users: Some(users), .. } => {
                assert!(users.iter().any(|u| u.username == "alice"));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }
}
