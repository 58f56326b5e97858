//! The agent: runs behind NAT, only ever dials out.
//!
//! It keeps one control connection to the server, heartbeats on it, and for
//! every open-tunnel request it receives dials the target and a fresh
//! tunnel connection back to the server, then relays between the two.

use std::sync::Arc;
use std::time::Duration;

use proto::control::{self, TunnelToken};
use proto::{pump, with_deadline, Config, Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct Agent {
    config: Arc<Config>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Register with the server and serve tunnel requests, reconnecting
    /// after failures. Returns when the server closes the control connection,
    /// unless `reconnect_on_close` is set.
    pub async fn run(&self) -> Result<()> {
        let endpoint = self.config.control_endpoint();
        let timeout = self.config.read_timeout();
        let backoff = self.config.reconnect_backoff();

        loop {
            tracing::debug!("try to connect server {} ...", endpoint);
            let mut control = match dial(&endpoint, timeout, "control dial").await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("connect {}: {}", endpoint, e);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            if let Err(e) = control::client_handshake(&mut control, timeout).await {
                tracing::error!("error handshaking: {}", e);
                drop(control);
                tokio::time::sleep(backoff).await;
                continue;
            }
            tracing::info!("registered with {} via {:?}", endpoint, control.local_addr().ok());

            match self.serve(control).await {
                Ok(()) if !self.config.reconnect_on_close => {
                    tracing::info!("server closed the control connection");
                    return Ok(());
                }
                Ok(()) => tracing::info!("server closed the control connection, reconnecting"),
                Err(e) => tracing::error!("control connection error: {}", e),
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Read open-tunnel requests until the control connection ends. `Ok`
    /// means a clean end-of-stream.
    async fn serve(&self, control: TcpStream) -> Result<()> {
        let (mut reader, writer) = control.into_split();

        let stop = CancellationToken::new();
        let _stop_heartbeat = stop.clone().drop_guard();
        tokio::spawn(send_heartbeats(writer, self.config.heartbeat_interval(), stop));

        loop {
            let token = match TunnelToken::read_from(&mut reader, self.config.port_compat).await {
                Ok(token) => token,
                Err(e) if e.is_eof() => return Ok(()),
                // A bad frame leaves the stream misaligned, so start over.
                Err(e) => return Err(e),
            };
            tracing::debug!("tunnel {} requested for {}", token.id, token.request);

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let id = token.id;
                if let Err(e) = handle_request(&config, token).await {
                    tracing::error!("tunnel {}: {}", id, e);
                }
            });
        }
    }
}

/// Dial the target, dial a tunnel carrying `token` as its handshake, and
/// relay between them.
async fn handle_request(config: &Config, token: TunnelToken) -> Result<()> {
    let timeout = config.read_timeout();

    let app = match dial(&token.request.address(), timeout, "target dial").await {
        Ok(app) => app,
        Err(e) => {
            // Answer with an empty tunnel so the server closes the client now.
            if let Ok(mut tunnel) = dial(&config.tunnel_endpoint(), timeout, "tunnel dial").await {
                let _ = tunnel.write_all(&token.encode()).await;
            }
            return Err(e);
        }
    };
    let mut tunnel = dial(&config.tunnel_endpoint(), timeout, "tunnel dial").await?;
    tunnel.write_all(&token.encode()).await?;

    let stats = pump(tunnel, app).await;
    tracing::debug!(
        "closed connection to {} ({} bytes up, {} bytes down)",
        token.request,
        stats.b_to_a,
        stats.a_to_b
    );
    Ok(())
}

async fn send_heartbeats(mut writer: OwnedWriteHalf, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = writer.write_all(control::HEARTBEAT).await {
                    tracing::debug!("heartbeat write error: {}", e);
                    break;
                }
            }
        }
    }
}

async fn dial(addr: &str, timeout: Duration, phase: &'static str) -> Result<TcpStream> {
    with_deadline(timeout, phase, async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok::<_, Error>(stream)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::AddressRequest;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(control_port: u16, tunnel_port: u16) -> Config {
        Config {
            server_addr: "127.0.0.1".into(),
            control_port,
            tunnel_port,
            timeout: 5,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 500,
            reconnect_backoff_ms: 50,
            ..Config::default()
        }
    }

    async fn accept_agent(listener: &TcpListener) -> TcpStream {
        let (mut control, _) = listener.accept().await.unwrap();
        control::server_handshake(&mut control, Duration::from_secs(5)).await.unwrap();
        control
    }

    #[tokio::test]
    async fn test_heartbeats_and_exit_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = Agent::new(test_config(port, 1)).unwrap();
        let running = tokio::spawn(async move { agent.run().await });

        let mut control = accept_agent(&listener).await;
        for _ in 0..3 {
            control::read_heartbeat(&mut control, Duration::from_secs(1)).await.unwrap();
        }

        // Half-close so unread heartbeats cannot turn the close into a reset.
        control.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retries_until_server_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A server that speaks the wrong reply first.
        let agent = Agent::new(test_config(port, 1)).unwrap();
        let running = tokio::spawn(async move { agent.run().await });

        let (mut bogus, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; control::HELLO.len()];
        bogus.read_exact(&mut hello).await.unwrap();
        bogus.write_all(b"hello world").await.unwrap();

        let mut control = accept_agent(&listener).await;
        control.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_opens_tunnel_to_target() {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let agent = Agent::new(test_config(
            control_listener.local_addr().unwrap().port(),
            tunnel_listener.local_addr().unwrap().port(),
        ))
        .unwrap();
        tokio::spawn(async move { agent.run().await });

        let mut control = accept_agent(&control_listener).await;
        let token = TunnelToken::new(
            42,
            AddressRequest::from_socket_addr(target.local_addr().unwrap()),
        );
        control.write_all(&token.encode()).await.unwrap();

        let (mut app, _) = target.accept().await.unwrap();
        let (mut tunnel, _) = tunnel_listener.accept().await.unwrap();

        let handshake = TunnelToken::read_from(&mut tunnel, proto::PortCompat::Strict)
            .await
            .unwrap();
        assert_eq!(handshake, token);

        tunnel.write_all(b"to target").await.unwrap();
        let mut buf = [0u8; 9];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to target");

        app.write_all(b"to server").await.unwrap();
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to server");

        drop(app);
        let mut rest = Vec::new();
        tunnel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_still_answers_tunnel() {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_target = closed.local_addr().unwrap();
        drop(closed);

        let agent = Agent::new(test_config(
            control_listener.local_addr().unwrap().port(),
            tunnel_listener.local_addr().unwrap().port(),
        ))
        .unwrap();
        tokio::spawn(async move { agent.run().await });

        let mut control = accept_agent(&control_listener).await;
        let token = TunnelToken::new(7, AddressRequest::from_socket_addr(dead_target));
        control.write_all(&token.encode()).await.unwrap();

        let (mut tunnel, _) = tunnel_listener.accept().await.unwrap();
        let handshake = TunnelToken::read_from(&mut tunnel, proto::PortCompat::Strict)
            .await
            .unwrap();
        assert_eq!(handshake, token);

        let mut rest = Vec::new();
        tunnel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bad_frame_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = Agent::new(test_config(port, 1)).unwrap();
        let running = tokio::spawn(async move { agent.run().await });

        let mut first = accept_agent(&listener).await;
        // Id followed by an unknown address type.
        first.write_all(&[0, 0, 0, 1, 0x09, 0, 0, 0]).await.unwrap();

        let mut second = accept_agent(&listener).await;
        second.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
        drop(first);
    }
}
