//! Inbound unit: owns the listening socket, validates handshakes, enforces
//! policy, records incoming messages, and acks them. If the listener itself
//! fails it rebinds with backoff; the node's supervisor restarts the whole
//! unit if the serving task dies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pigeon_core::{Direction, PeerRequest, PeerResponse, PolicyDecision, SessionId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::state::NodeState;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const REBIND_DELAY_FIRST: Duration = Duration::from_secs(2);
const REBIND_DELAY_NEXT: Duration = Duration::from_secs(5);

/// Notification pushed to the node when a message is accepted inbound.
/// The history append has already happened by the time this is sent.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session: SessionId,
    pub from: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

struct AcceptorStatus {
    listening: AtomicBool,
    port: AtomicU16,
}

/// Handle on a running acceptor task.
pub struct Acceptor {
    status: Arc<AcceptorStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Acceptor {
    /// Bind and start serving. If the preferred port is busy the OS picks one;
    /// the caller reads the actual port back and re-registers with it.
    pub async fn spawn(
        host: &str,
        preferred_port: u16,
        state: Arc<NodeState>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> std::io::Result<Acceptor> {
        let listener = bind_with_fallback(host, preferred_port).await?;
        let port = listener.local_addr()?.port();
        tracing::info!(host, port, "acceptor listening");

        let status = Arc::new(AcceptorStatus {
            listening: AtomicBool::new(true),
            port: AtomicU16::new(port),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            host.to_string(),
            preferred_port,
            Arc::clone(&status),
            state,
            inbound,
            shutdown_rx,
        ));
        Ok(Acceptor {
            status,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.status.port.load(Ordering::SeqCst)
    }

    /// True while the listener is bound. False during a rebind window.
    pub fn is_listening(&self) -> bool {
        self.status.listening.load(Ordering::SeqCst)
    }

    /// Dead means the serving task itself is gone. An acceptor mid-rebind is
    /// still alive; the supervisor must not restart it for that.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the task to stop and wait up to `grace` for it, then abort.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!("acceptor did not stop in time, aborting");
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn kill_for_test(&self) {
        self.task.abort();
    }
}

async fn accept_loop(
    mut listener: TcpListener,
    host: String,
    preferred_port: u16,
    status: Arc<AcceptorStatus>,
    state: Arc<NodeState>,
    inbound: mpsc::Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let session = SessionId::new();
                    tracing::debug!(%session, %addr, "inbound connection");
                    tokio::spawn(serve_session(
                        stream,
                        addr,
                        session,
                        Arc::clone(&state),
                        inbound.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed, rebinding listener");
                    status.listening.store(false, Ordering::SeqCst);
                    match rebind(&host, preferred_port, &mut shutdown).await {
                        Some(bound) => {
                            listener = bound;
                            if let Ok(addr) = listener.local_addr() {
                                status.port.store(addr.port(), Ordering::SeqCst);
                                tracing::info!(port = addr.port(), "listener rebound");
                            }
                            status.listening.store(true, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            }
        }
    }
    status.listening.store(false, Ordering::SeqCst);
    tracing::info!("acceptor stopped");
}

/// Retry binding until it works or shutdown is requested. Short delay first,
/// longer between later attempts.
async fn rebind(
    host: &str,
    preferred_port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpListener> {
    let mut delay = REBIND_DELAY_FIRST;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match bind_with_fallback(host, preferred_port).await {
            Ok(listener) => return Some(listener),
            Err(e) => {
                tracing::warn!(error = %e, "rebind attempt failed");
                delay = REBIND_DELAY_NEXT;
            }
        }
    }
}

async fn bind_with_fallback(host: &str, preferred_port: u16) -> std::io::Result<TcpListener> {
    if preferred_port != 0 {
        match TcpListener::bind((host, preferred_port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::warn!(port = preferred_port, error = %e, "preferred port unavailable");
            }
        }
    }
    TcpListener::bind((host, 0)).await
}

async fn serve_session(
    stream: TcpStream,
    addr: SocketAddr,
    session: SessionId,
    state: Arc<NodeState>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    if let Err(e) = serve_session_inner(stream, addr, session, state, inbound).await {
        tracing::debug!(%session, error = %e, "session ended with error");
    }
}

async fn serve_session_inner(
    stream: TcpStream,
    addr: SocketAddr,
    session: SessionId,
    state: Arc<NodeState>,
    inbound: mpsc::Sender<InboundMessage>,
) -> std::io::Result<()> {
    let (read_half, mut write) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    // Handshake must arrive promptly.
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;
    if n == 0 {
        return Ok(());
    }

    let peer = match pigeon_core::decode_line::<PeerRequest>(&line) {
        Ok(PeerRequest::Connect { username, .. }) => username,
        // Anything else before the handshake is a protocol violation:
        // answer once, then close the socket.
        _ => {
            reject(&mut write, "Invalid connection request").await?;
            return Ok(());
        }
    };

    let (decision, cleared_mute) = {
        let mut policy = state.policy.lock().await;
        let had_mute = policy.muted().any(|(name, _)| name == peer);
        let decision = policy.check(&peer, Utc::now());
        (decision, had_mute && decision == PolicyDecision::Allowed)
    };
    match decision {
        PolicyDecision::Blocked => {
            tracing::info!(%session, peer = %peer, "handshake rejected: blocked");
            reject(&mut write, "Connection rejected: user is blocked").await?;
            return Ok(());
        }
        PolicyDecision::Muted(until) => {
            tracing::info!(%session, peer = %peer, %until, "handshake rejected: muted");
            reject(&mut write, "Connection rejected: user is muted").await?;
            return Ok(());
        }
        PolicyDecision::Allowed => {}
    }
    if cleared_mute {
        // The check dropped an expired mute; persist that.
        state.save_profile().await;
    }

    write
        .write_all(&encode_response(&PeerResponse::success("Connection accepted"))?)
        .await?;
    tracing::info!(%session, peer = %peer, %addr, "session open");

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        match pigeon_core::decode_line::<PeerRequest>(&line) {
            Ok(PeerRequest::Message {
                from,
                content,
                timestamp,
            }) => {
                state
                    .record_message(&from, Direction::Incoming, &content, timestamp)
                    .await;
                state
                    .observe_contact(&from, &addr.ip().to_string(), addr.port(), Utc::now())
                    .await;
                let event = InboundMessage {
                    session,
                    from,
                    content,
                    timestamp,
                };
                if inbound.send(event).await.is_err() {
                    tracing::warn!(%session, "inbound channel closed, dropping notification");
                }
                write
                    .write_all(&encode_response(&PeerResponse::success("Message received"))?)
                    .await?;
            }
            // Repeated handshakes and unparseable lines are ignored.
            Ok(PeerRequest::Connect { .. }) | Err(_) => continue,
        }
    }
    tracing::debug!(%session, peer = %peer, "session closed");
    Ok(())
}

fn encode_response(resp: &PeerResponse) -> std::io::Result<Vec<u8>> {
    pigeon_core::encode_line(resp).map_err(std::io::Error::other)
}

async fn reject(write: &mut OwnedWriteHalf, message: &str) -> std::io::Result<()> {
    write
        .write_all(&encode_response(&PeerResponse::error(message))?)
        .await
}
