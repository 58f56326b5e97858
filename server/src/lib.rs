//! Public side of the tunnel: a SOCKS5 port for proxy clients, a control
//! port where the agent registers, and a per-session tunnel port where the
//! agent dials back one connection per proxied stream.

pub mod rendezvous;
pub mod session;
pub mod socks;

use std::net::SocketAddr;
use std::sync::Arc;

use proto::{pump, Config, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;

pub use session::{ControlSession, SessionSlot, SessionStatus};
pub use socks::Credentials;

/// Main server instance.
pub struct Server {
    config: Arc<Config>,
    credentials: Arc<Credentials>,
    sessions: Arc<SessionSlot>,
    socks: TcpListener,
    control: TcpListener,
}

impl Server {
    /// Bind the SOCKS5 and control listeners.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        let socks = listen(&config.listen_addr, config.server_port, "socks5").await?;
        let control = listen(&config.listen_addr, config.control_port, "control").await?;

        Ok(Self {
            credentials: Arc::new(Credentials::new(&config.user_name, &config.password)),
            sessions: Arc::new(SessionSlot::new(config.session_policy)),
            config: Arc::new(config),
            socks,
            control,
        })
    }

    pub fn socks_addr(&self) -> Result<SocketAddr> {
        Ok(self.socks.local_addr()?)
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    /// Shared handle to the installed control session.
    pub fn sessions(&self) -> Arc<SessionSlot> {
        Arc::clone(&self.sessions)
    }

    /// Serve until the SOCKS5 listener fails.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(serve_control(
            self.control,
            Arc::clone(&self.sessions),
            Arc::clone(&self.config),
        ));
        serve_socks5(self.socks, self.sessions, self.config, self.credentials).await
    }
}

async fn listen(host: &str, port: u16, name: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!("start listen {} at {}", name, listener.local_addr()?);
    Ok(listener)
}

async fn serve_control(listener: TcpListener, sessions: Arc<SessionSlot>, config: Arc<Config>) {
    let mut incoming = TcpListenerStream::new(listener);
    while let Some(conn) = incoming.next().await {
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("control accept error: {}", e);
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!("control peer address: {}", e);
                continue;
            }
        };
        tracing::debug!("control connection from {}", peer);

        let sessions = Arc::clone(&sessions);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = session::handle_control(sessions, config, stream, peer).await {
                tracing::warn!("control connection {}: {}", peer, e);
            }
        });
    }
}

async fn serve_socks5(
    listener: TcpListener,
    sessions: Arc<SessionSlot>,
    config: Arc<Config>,
    credentials: Arc<Credentials>,
) -> Result<()> {
    let mut incoming = TcpListenerStream::new(listener);
    while let Some(conn) = incoming.next().await {
        let client = match conn {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("socks5 accept error: {}", e);
                continue;
            }
        };

        let session = match sessions.live() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("refusing socks5 client: {}", e);
                continue;
            }
        };

        let config = Arc::clone(&config);
        let credentials = Arc::clone(&credentials);
        tokio::spawn(async move {
            let peer = client.peer_addr().ok();
            if let Err(e) = handle_socks5(client, session, &config, &credentials).await {
                if e.is_protocol_violation() {
                    tracing::warn!("socks5 client {:?}: {}", peer, e);
                } else {
                    tracing::debug!("socks5 client {:?}: {}", peer, e);
                }
            }
        });
    }
    Ok(())
}

async fn handle_socks5(
    mut client: TcpStream,
    session: Arc<ControlSession>,
    config: &Config,
    credentials: &Credentials,
) -> Result<()> {
    let timeout = config.read_timeout();
    let request = socks::handshake(&mut client, credentials, timeout, config.port_compat).await?;
    tracing::debug!("request address: {}", request);

    let tunnel = session.open_tunnel(&request, timeout).await?;
    let stats = pump(client, tunnel).await;
    tracing::debug!(
        "closed connection to {} ({} bytes up, {} bytes down)",
        request,
        stats.a_to_b,
        stats.b_to_a
    );
    Ok(())
}
