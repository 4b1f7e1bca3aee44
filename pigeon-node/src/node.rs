//! Peer node orchestrator: registration, resolution, outbound messaging,
//! policy commands, and supervision of the inbound acceptor.
//!
//! Outbound sessions are one-shot and owned by the dialing side: dial,
//! handshake, send, await the ack, close. The accepting side serves a session
//! until the dialer hangs up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pigeon_core::{
    ContactEntry, Direction, HistoryEntry, PeerRequest, PeerResponse, PolicyDecision, QueryKind,
    SessionId, WireError, STALE_AFTER,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::acceptor::{Acceptor, InboundMessage};
use crate::config::Config;
use crate::directory_client::{reachable_ip, DirectoryClient, DirectoryClientError};
use crate::state::NodeState;

pub const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where an outbound exchange was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Dialing,
    Handshaking,
    Sending,
    AwaitingAck,
}

impl fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangePhase::Dialing => "dialing",
            ExchangePhase::Handshaking => "handshaking",
            ExchangePhase::Sending => "sending",
            ExchangePhase::AwaitingAck => "awaiting ack",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{0} is not registered")]
    NotFound(String),
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryClientError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0} is blocked")]
    Blocked(String),
    #[error("{0} is muted until {1}")]
    Muted(String, DateTime<Utc>),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("timed out while {0}")]
    Timeout(ExchangePhase),
    #[error("io error while {0}: {1}")]
    Io(ExchangePhase, #[source] std::io::Error),
    #[error("peer closed the connection while {0}")]
    ClosedEarly(ExchangePhase),
    #[error("peer rejected us while {0}: {1}")]
    Rejected(ExchangePhase, String),
    #[error("protocol error while {0}: {1}")]
    Wire(ExchangePhase, #[source] WireError),
}

pub struct PeerNode {
    cfg: Config,
    state: Arc<NodeState>,
    directory: DirectoryClient,
    acceptor: Mutex<Option<Acceptor>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InboundMessage>>>,
    shutdown: watch::Sender<bool>,
}

impl PeerNode {
    /// Load per-user state and start the acceptor. Does not register with the
    /// directory; call `register` once the node is up.
    pub async fn start(username: &str, cfg: Config) -> std::io::Result<Arc<Self>> {
        let state = Arc::new(NodeState::load(username, &cfg)?);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let acceptor =
            Acceptor::spawn(&cfg.host, cfg.port, Arc::clone(&state), inbound_tx.clone()).await?;
        let advertised = if cfg.host == "0.0.0.0" {
            reachable_ip()
        } else {
            cfg.host.clone()
        };
        *state.endpoint.lock().await = (advertised, acceptor.port());

        let directory = DirectoryClient::new(cfg.directory_host.clone(), cfg.directory_port);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            cfg,
            state,
            directory,
            acceptor: Mutex::new(Some(acceptor)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            subscribers: Mutex::new(Vec::new()),
            shutdown,
        }))
    }

    pub fn username(&self) -> &str {
        &self.state.username
    }

    /// Port the acceptor is currently listening on.
    pub async fn port(&self) -> u16 {
        match self.acceptor.lock().await.as_ref() {
            Some(acceptor) => acceptor.port(),
            None => 0,
        }
    }

    pub async fn acceptor_alive(&self) -> bool {
        self.acceptor
            .lock()
            .await
            .as_ref()
            .map(Acceptor::is_alive)
            .unwrap_or(false)
    }

    /// Bind this node's username to its listening endpoint in the directory.
    pub async fn register(&self) -> Result<(), DirectoryClientError> {
        let (ip, port) = self.state.endpoint.lock().await.clone();
        let mut profile = BTreeMap::new();
        profile.insert("status".to_string(), "online".to_string());
        self.directory
            .register(&self.state.username, &ip, port, profile)
            .await?;
        self.state.save_profile().await;
        tracing::info!(ip, port, "registered with directory");
        Ok(())
    }

    /// Resolve `peer` to an address: fresh cache entry first, then the
    /// directory. A stale entry is only used when the directory is down.
    pub async fn resolve(&self, peer: &str) -> Result<(String, u16), ResolveError> {
        let now = Utc::now();
        if let Some(entry) = self.state.contacts.lock().await.get_fresh(peer, now) {
            return Ok((entry.ip.clone(), entry.port));
        }
        match self.directory.query(QueryKind::ByName, peer).await {
            Ok(users) => {
                // The query matches substrings; require the exact name.
                match users
                    .into_iter()
                    .find(|u| u.username.eq_ignore_ascii_case(peer))
                {
                    Some(rec) => {
                        self.state
                            .observe_contact(&rec.username, &rec.ip, rec.port, now)
                            .await;
                        Ok((rec.ip, rec.port))
                    }
                    None => Err(ResolveError::NotFound(peer.to_string())),
                }
            }
            Err(e) => {
                if let Some(entry) = self.state.contacts.lock().await.get(peer) {
                    tracing::warn!(peer, error = %e, "directory lookup failed, using stale contact");
                    return Ok((entry.ip.clone(), entry.port));
                }
                Err(ResolveError::Directory(e))
            }
        }
    }

    /// Send one message to `peer`: policy gate, resolve, dial, handshake,
    /// send, await ack, close. Only an acked message is recorded as outgoing.
    pub async fn connect_and_send(&self, peer: &str, content: &str) -> Result<(), SendError> {
        match self.state.policy.lock().await.check(peer, Utc::now()) {
            PolicyDecision::Blocked => return Err(SendError::Blocked(peer.to_string())),
            PolicyDecision::Muted(until) => {
                return Err(SendError::Muted(peer.to_string(), until))
            }
            PolicyDecision::Allowed => {}
        }

        let (ip, port) = self.resolve(peer).await?;
        let session = SessionId::new();
        let sent_at = Utc::now();
        self.exchange(session, &ip, port, content, sent_at).await?;

        self.state
            .record_message(peer, Direction::Outgoing, content, sent_at)
            .await;
        self.state.observe_contact(peer, &ip, port, Utc::now()).await;
        tracing::info!(%session, peer, "message delivered");
        Ok(())
    }

    async fn exchange(
        &self,
        session: SessionId,
        ip: &str,
        port: u16,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), SendError> {
        let phase = ExchangePhase::Dialing;
        tracing::debug!(%session, ip, port, "dialing");
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| SendError::Timeout(phase))?
            .map_err(|e| SendError::Io(phase, e))?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let phase = ExchangePhase::Handshaking;
        let hello = PeerRequest::Connect {
            username: self.state.username.clone(),
            timestamp: Utc::now(),
        };
        write_line(&mut write, &hello, phase).await?;
        let resp = read_response(&mut reader, phase).await?;
        if !resp.is_success() {
            return Err(SendError::Rejected(phase, resp.message));
        }

        let phase = ExchangePhase::Sending;
        let message = PeerRequest::Message {
            from: self.state.username.clone(),
            content: content.to_string(),
            timestamp: sent_at,
        };
        write_line(&mut write, &message, phase).await?;

        let phase = ExchangePhase::AwaitingAck;
        let resp = read_response(&mut reader, phase).await?;
        if !resp.is_success() {
            return Err(SendError::Rejected(phase, resp.message));
        }
        // The dialer owns the session lifetime: acked, so hang up.
        Ok(())
    }

    /// Is `peer` registered and recently seen by the directory?
    pub async fn check_peer_online(&self, peer: &str) -> Result<bool, DirectoryClientError> {
        let users = self.directory.query(QueryKind::ByName, peer).await?;
        let now = Utc::now();
        Ok(users.iter().any(|u| {
            u.username.eq_ignore_ascii_case(peer)
                && now
                    .signed_duration_since(u.last_seen)
                    .to_std()
                    .map(|age| age < STALE_AFTER)
                    .unwrap_or(true)
        }))
    }

    pub async fn block(&self, peer: &str) {
        self.state.policy.lock().await.block(peer);
        self.state.save_profile().await;
        tracing::info!(peer, "blocked");
    }

    pub async fn unblock(&self, peer: &str) -> bool {
        let removed = self.state.policy.lock().await.unblock(peer);
        self.state.save_profile().await;
        removed
    }

    pub async fn mute(&self, peer: &str, duration: Duration) {
        self.state
            .policy
            .lock()
            .await
            .mute(peer, duration, Utc::now());
        self.state.save_profile().await;
        tracing::info!(peer, ?duration, "muted");
    }

    pub async fn unmute(&self, peer: &str) -> bool {
        let removed = self.state.policy.lock().await.unmute(peer);
        self.state.save_profile().await;
        removed
    }

    pub async fn history(&self, peer: &str) -> Vec<HistoryEntry> {
        self.state.history.lock().await.conversation(peer).to_vec()
    }

    pub async fn contacts(&self) -> Vec<ContactEntry> {
        self.state.contacts.lock().await.iter().cloned().collect()
    }

    pub async fn add_contact(&self, username: &str, ip: &str, port: u16) {
        self.state.observe_contact(username, ip, port, Utc::now()).await;
    }

    pub async fn remove_contact(&self, username: &str) -> bool {
        let removed = self.state.contacts.lock().await.remove(username);
        self.state.save_contacts().await;
        removed
    }

    /// Incoming-message notifications. The history append has already happened
    /// when an event arrives here.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// One supervision tick: if the acceptor task died, replace it and
    /// re-register so the directory sees the new port.
    pub async fn ensure_acceptor(&self) {
        let mut guard = self.acceptor.lock().await;
        if guard.as_ref().map(Acceptor::is_alive).unwrap_or(false) {
            return;
        }
        tracing::warn!("acceptor is down, restarting");
        if let Some(old) = guard.take() {
            old.shutdown(Duration::from_millis(100)).await;
        }
        match Acceptor::spawn(
            &self.cfg.host,
            self.cfg.port,
            Arc::clone(&self.state),
            self.inbound_tx.clone(),
        )
        .await
        {
            Ok(acceptor) => {
                let port = acceptor.port();
                *guard = Some(acceptor);
                drop(guard);
                self.state.endpoint.lock().await.1 = port;
                if let Err(e) = self.register().await {
                    tracing::warn!(error = %e, "re-registration after restart failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "acceptor restart failed, will retry");
            }
        }
    }

    /// Spawn the supervision loop and the inbound-notification loop. Both exit
    /// on `shutdown`.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(SUPERVISION_INTERVAL) => node.ensure_acceptor().await,
                }
            }
        }));

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let Some(mut rx) = node.inbound_rx.lock().await.take() else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Some(event) => node.deliver(event).await,
                        None => break,
                    }
                }
            }
        }));

        handles
    }

    async fn deliver(&self, event: InboundMessage) {
        tracing::info!(from = %event.from, session = %event.session, "message received");
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stop the loops and the acceptor, then persist everything.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            acceptor.shutdown(SHUTDOWN_GRACE).await;
        }
        self.state.save_profile().await;
        self.state.save_contacts().await;
        tracing::info!("node stopped");
    }

    #[cfg(test)]
    pub(crate) async fn kill_acceptor_for_test(&self) {
        if let Some(acceptor) = self.acceptor.lock().await.as_ref() {
            acceptor.kill_for_test();
        }
    }
}

async fn write_line<T: serde::Serialize>(
    write: &mut OwnedWriteHalf,
    value: &T,
    phase: ExchangePhase,
) -> Result<(), SendError> {
    let bytes = pigeon_core::encode_line(value).map_err(|e| SendError::Wire(phase, e))?;
    tokio::time::timeout(EXCHANGE_TIMEOUT, write.write_all(&bytes))
        .await
        .map_err(|_| SendError::Timeout(phase))?
        .map_err(|e| SendError::Io(phase, e))
}

async fn read_response(
    reader: &mut BufReader<OwnedReadHalf>,
    phase: ExchangePhase,
) -> Result<PeerResponse, SendError> {
    let mut line = String::new();
    let n = tokio::time::timeout(EXCHANGE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| SendError::Timeout(phase))?
        .map_err(|e| SendError::Io(phase, e))?;
    if n == 0 {
        return Err(SendError::ClosedEarly(phase));
    }
    pigeon_core::decode_line(&line).map_err(|e| SendError::Wire(phase, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pigeon_directory::DirectoryServer;

    async fn start_directory() -> (u16, watch::Sender<bool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = pigeon_directory::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: dir.path().to_path_buf(),
        };
        let server = DirectoryServer::bind(&cfg).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));
        (port, tx, dir)
    }

    async fn start_node(username: &str, directory_port: u16) -> (Arc<PeerNode>, tempfile::TempDir) {
        let data = tempfile::tempdir().unwrap();
        let cfg = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            directory_host: "127.0.0.1".to_string(),
            directory_port,
            data_dir: data.path().to_path_buf(),
        };
        let node = PeerNode::start(username, cfg).await.unwrap();
        node.register().await.unwrap();
        (node, data)
    }

    #[tokio::test]
    async fn message_reaches_peer_and_both_histories() {
        let (dir_port, _dir_shutdown, _dir) = start_directory().await;
        let (alice, _a) = start_node("alice", dir_port).await;
        let (bob, _b) = start_node("bob", dir_port).await;

        let mut inbox = bob.subscribe().await;
        let _loops = bob.spawn_loops();

        alice.connect_and_send("bob", "hi bob").await.unwrap();

        // Sender records outgoing only after the ack.
        let sent = alice.history("bob").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].direction, Direction::Outgoing);
        assert_eq!(sent[0].content, "hi bob");

        // Receiver recorded it before acking.
        let received = bob.history("alice").await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].direction, Direction::Incoming);
        assert_eq!(received[0].content, "hi bob");

        let event = inbox.recv().await.unwrap();
        assert_eq!(event.from, "alice");
        assert_eq!(event.content, "hi bob");

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn blocked_peer_fails_before_any_network_use() {
        // Directory on a dead port: if the policy gate let anything through,
        // resolution would fail with a directory error instead of Blocked.
        let data = tempfile::tempdir().unwrap();
        let cfg = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            directory_host: "127.0.0.1".to_string(),
            directory_port: 1,
            data_dir: data.path().to_path_buf(),
        };
        let node = PeerNode::start("alice", cfg).await.unwrap();

        node.block("bob").await;
        let err = node.connect_and_send("bob", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Blocked(_)));

        node.unblock("bob").await;
        let err = node.connect_and_send("bob", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Resolve(_)));
    }

    #[tokio::test]
    async fn mute_blocks_outbound_until_expiry() {
        let (dir_port, _dir_shutdown, _dir) = start_directory().await;
        let (alice, _a) = start_node("alice", dir_port).await;
        let (bob, _b) = start_node("bob", dir_port).await;

        alice.mute("bob", Duration::from_millis(50)).await;
        let err = alice.connect_and_send("bob", "too soon").await.unwrap_err();
        assert!(matches!(err, SendError::Muted(_, _)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        alice.connect_and_send("bob", "after expiry").await.unwrap();
        assert_eq!(bob.history("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let (dir_port, _dir_shutdown, _dir) = start_directory().await;
        let (alice, _a) = start_node("alice", dir_port).await;

        let err = alice.connect_and_send("ghost", "hello?").await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Resolve(ResolveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_directory() {
        let (dir_port, dir_shutdown, _dir) = start_directory().await;
        let (alice, _a) = start_node("alice", dir_port).await;
        let (bob, _b) = start_node("bob", dir_port).await;

        let (ip, port) = alice.resolve("bob").await.unwrap();
        assert_eq!(port, bob.port().await);

        // Directory goes away; the cached entry still resolves.
        let _ = dir_shutdown.send(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (ip2, port2) = alice.resolve("bob").await.unwrap();
        assert_eq!((ip, port), (ip2, port2));
    }

    #[tokio::test]
    async fn supervisor_replaces_dead_acceptor_and_reregisters() {
        let (dir_port, _dir_shutdown, _dir) = start_directory().await;

        // Pin the port so the restarted acceptor keeps the same endpoint and
        // the directory accepts the re-registration as an in-place update.
        let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let pinned = probe.local_addr().unwrap().port();
        drop(probe);

        let data = tempfile::tempdir().unwrap();
        let cfg = Config {
            host: "127.0.0.1".to_string(),
            port: pinned,
            directory_host: "127.0.0.1".to_string(),
            directory_port: dir_port,
            data_dir: data.path().to_path_buf(),
        };
        let alice = PeerNode::start("alice", cfg).await.unwrap();
        alice.register().await.unwrap();

        alice.kill_acceptor_for_test().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!alice.acceptor_alive().await);

        alice.ensure_acceptor().await;
        assert!(alice.acceptor_alive().await);
        assert_eq!(alice.port().await, pinned);

        // The directory still resolves alice at the pinned endpoint.
        let client = DirectoryClient::new("127.0.0.1", dir_port);
        let users = client.query(QueryKind::ByName, "alice").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].port, pinned);
    }

    #[tokio::test]
    async fn contact_management_roundtrip() {
        let data = tempfile::tempdir().unwrap();
        let cfg = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            directory_host: "127.0.0.1".to_string(),
            directory_port: 1,
            data_dir: data.path().to_path_buf(),
        };
        let node = PeerNode::start("alice", cfg).await.unwrap();

        node.add_contact("bob", "10.0.0.2", 9002).await;
        let contacts = node.contacts().await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].username, "bob");

        assert!(node.remove_contact("bob").await);
        assert!(!node.remove_contact("bob").await);
        assert!(node.contacts().await.is_empty());
    }
}
