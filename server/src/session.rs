//! Control session: the one registered agent, its heartbeat and its tunnels.
//!
//! At most one session is installed at a time. A session lives exactly as
//! long as its control connection keeps delivering heartbeats; when it dies
//! it releases its tunnel listener, fails every pending request and clears
//! itself from the [`SessionSlot`] so new SOCKS5 clients are refused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use proto::control::{self, TunnelToken};
use proto::{with_deadline, AddressRequest, Config, Error, PortCompat, Result, SessionPolicy};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::rendezvous::PendingTunnels;

/// Unique session identifier.
pub type SessionId = u64;

/// Read-only view of the installed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub agent_addr: SocketAddr,
    pub tunnel_addr: SocketAddr,
    pub uptime: Duration,
    pub pending_tunnels: usize,
}

/// A registered agent.
pub struct ControlSession {
    id: SessionId,
    agent_addr: SocketAddr,
    tunnel_addr: SocketAddr,
    started: Instant,
    outbound: mpsc::Sender<TunnelToken>,
    pending: Arc<PendingTunnels<TcpStream>>,
    /// Cancelled to tear the session down.
    shutdown: CancellationToken,
    /// Cancelled once the tunnel listener is gone and the slot is cleared.
    released: CancellationToken,
}

impl ControlSession {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            agent_addr: self.agent_addr,
            tunnel_addr: self.tunnel_addr,
            uptime: self.started.elapsed(),
            pending_tunnels: self.pending.len(),
        }
    }

    /// Ask the agent for a tunnel to `request` and wait for it to arrive.
    pub async fn open_tunnel(&self, request: &AddressRequest, timeout: Duration) -> Result<TcpStream> {
        let waiter = self.pending.register(request)?;
        tracing::debug!("session {} requesting tunnel {} for {}", self.id, waiter.id(), request);

        self.outbound
            .send(TunnelToken::new(waiter.id(), request.clone()))
            .await
            .map_err(|_| Error::SessionClosed)?;

        with_deadline(timeout, "tunnel rendezvous", waiter.wait()).await
    }

    /// Start tearing the session down. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.pending.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has released its tunnel listener.
    pub async fn released(&self) {
        self.released.cancelled().await
    }
}

/// Holder of the single installed session.
pub struct SessionSlot {
    current: RwLock<Option<Arc<ControlSession>>>,
    /// Serializes installs so one handshake at a time can replace the session.
    registration: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    policy: SessionPolicy,
}

impl SessionSlot {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            current: RwLock::new(None),
            registration: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    /// The installed session, if any.
    pub fn current(&self) -> Option<Arc<ControlSession>> {
        self.current.read().clone()
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.current().map(|s| s.status())
    }

    /// The installed session if it can still take requests.
    pub fn live(&self) -> Result<Arc<ControlSession>> {
        self.current()
            .filter(|s| !s.is_closed())
            .ok_or(Error::NoSession)
    }

    /// Remove `id` if it is still the installed session.
    fn clear(&self, id: SessionId) -> bool {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|s| s.id == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Install a session for a freshly handshaken agent, replacing or
    /// refusing the existing one according to the policy.
    async fn activate(
        &self,
        agent_addr: SocketAddr,
        tunnel_bind: &str,
    ) -> Result<(Arc<ControlSession>, mpsc::Receiver<TunnelToken>, TcpListener)> {
        let _registration = self.registration.lock().await;

        if let Some(old) = self.current() {
            if self.policy == SessionPolicy::Reject {
                return Err(Error::SessionBusy);
            }
            tracing::info!(
                "agent {} supersedes session {} from {}",
                agent_addr,
                old.id,
                old.agent_addr
            );
            old.close();
            old.released().await;
        }

        let listener = TcpListener::bind(tunnel_bind).await?;
        let tunnel_addr = listener.local_addr()?;
        let (outbound, outbound_rx) = mpsc::channel(64);

        let session = Arc::new(ControlSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            agent_addr,
            tunnel_addr,
            started: Instant::now(),
            outbound,
            pending: PendingTunnels::new(),
            shutdown: CancellationToken::new(),
            released: CancellationToken::new(),
        });
        *self.current.write() = Some(Arc::clone(&session));

        tracing::info!("session {} active, tunnels on {}", session.id, tunnel_addr);
        Ok((session, outbound_rx, listener))
    }
}

/// Drive one inbound control connection from handshake to session death.
pub(crate) async fn handle_control(
    slot: Arc<SessionSlot>,
    config: Arc<Config>,
    mut stream: TcpStream,
    agent_addr: SocketAddr,
) -> Result<()> {
    control::server_handshake(&mut stream, config.read_timeout()).await?;

    let tunnel_bind = format!("{}:{}", config.listen_addr, config.tunnel_port);
    let (session, outbound_rx, listener) = slot.activate(agent_addr, &tunnel_bind).await?;

    let (reader, writer) = stream.into_split();
    let reason = run_session(&session, &config, reader, writer, outbound_rx, listener).await;

    session.close();
    slot.clear(session.id);
    session.released.cancel();

    match reason {
        Some(e) => tracing::warn!("agent {} is dead: {}", agent_addr, e),
        None => tracing::info!("session {} closed", session.id),
    }
    Ok(())
}

/// Returns the error that killed the session, or `None` if it was closed
/// from outside.
async fn run_session(
    session: &Arc<ControlSession>,
    config: &Config,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound_rx: mpsc::Receiver<TunnelToken>,
    listener: TcpListener,
) -> Option<Error> {
    let writer_task = tokio::spawn(control_writer(writer, outbound_rx, session.shutdown.clone()));

    let heartbeat = watch_heartbeat(reader, config.heartbeat_timeout());
    tokio::pin!(heartbeat);

    let mut incoming = TcpListenerStream::new(listener);
    let reason = loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => break None,
            e = &mut heartbeat => break Some(e),
            conn = incoming.next() => match conn {
                Some(Ok(stream)) => {
                    let session = Arc::clone(session);
                    let timeout = config.read_timeout();
                    let compat = config.port_compat;
                    tokio::spawn(async move {
                        if let Err(e) = handle_tunnel(&session, stream, timeout, compat).await {
                            tracing::warn!("tunnel handshake: {}", e);
                        }
                    });
                }
                Some(Err(e)) => tracing::warn!("tunnel accept error: {}", e),
                None => break None,
            },
        }
    };

    // Stops the writer, which drops the control write half.
    session.close();
    drop(incoming);
    let _ = writer_task.await;
    reason
}

async fn watch_heartbeat(mut reader: OwnedReadHalf, timeout: Duration) -> Error {
    loop {
        if let Err(e) = control::read_heartbeat(&mut reader, timeout).await {
            return e;
        }
        tracing::trace!("heartbeat");
    }
}

/// Forward open-tunnel requests to the agent. A write failure kills the
/// session.
async fn control_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<TunnelToken>,
    shutdown: CancellationToken,
) {
    loop {
        let token = tokio::select! {
            _ = shutdown.cancelled() => break,
            token = rx.recv() => match token {
                Some(token) => token,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&token.encode()).await {
            tracing::warn!("control write error: {}", e);
            shutdown.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn handle_tunnel(
    session: &ControlSession,
    mut stream: TcpStream,
    timeout: Duration,
    compat: PortCompat,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let token = with_deadline(timeout, "tunnel handshake", async {
        TunnelToken::read_from(&mut stream, compat).await
    })
    .await?;
    tracing::debug!("tunnel {} from {} for {}", token.id, peer, token.request);

    session.pending.deliver(&token, stream)
}
