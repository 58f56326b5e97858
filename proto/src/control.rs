//! Control and tunnel wire protocol between server and agent.
//!
//! Control connection, agent → server:
//!
//! ```text
//! "hello server"                      once, then
//! "keep alive"                        every heartbeat interval
//! ```
//!
//! Control connection, server → agent:
//!
//! ```text
//! "hello local"                       once, then per request:
//! +-----------+------+------+------+
//! | TUNNEL ID | ATYP | ADDR | PORT |  id is a big-endian u32
//! +-----------+------+------+------+
//! ```
//!
//! A tunnel connection opens with the same id + token frame it was asked
//! for, then carries raw stream bytes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::{AddressRequest, PortCompat};
use crate::error::{Error, Result};
use crate::with_deadline;

/// Sent by the agent to open a control session.
pub const HELLO: &[u8] = b"hello server";

/// Sent by the server to accept a control session.
pub const REPLY: &[u8] = b"hello local";

/// Liveness token the agent repeats on the control connection.
pub const HEARTBEAT: &[u8] = b"keep alive";

/// Correlates an open-tunnel message with the tunnel connection it causes.
pub type TunnelId = u32;

/// An open-tunnel request, and the handshake of the tunnel it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelToken {
    pub id: TunnelId,
    pub request: AddressRequest,
}

impl TunnelToken {
    pub fn new(id: TunnelId, request: AddressRequest) -> Self {
        Self { id, request }
    }

    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let raw = self.request.raw();
        let mut buf = Vec::with_capacity(4 + raw.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(raw);
        buf
    }

    /// Read exactly one frame.
    pub async fn read_from<R>(reader: &mut R, compat: PortCompat) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let id = reader.read_u32().await?;
        let request = AddressRequest::read_from(reader, compat).await?;
        Ok(Self { id, request })
    }
}

/// Agent side of the control handshake.
pub async fn client_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(HELLO).await?;

    let mut buf = [0u8; REPLY.len()];
    with_deadline(timeout, "control handshake", async {
        stream.read_exact(&mut buf).await?;
        Ok::<_, Error>(())
    })
    .await?;

    if buf != REPLY {
        return Err(Error::BadHandshake);
    }
    Ok(())
}

/// Server side of the control handshake.
pub async fn server_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HELLO.len()];
    with_deadline(timeout, "control handshake", async {
        stream.read_exact(&mut buf).await?;
        Ok::<_, Error>(())
    })
    .await?;

    if buf != HELLO {
        return Err(Error::BadHandshake);
    }
    stream.write_all(REPLY).await?;
    Ok(())
}

/// Wait for the next heartbeat frame.
pub async fn read_heartbeat<R>(reader: &mut R, timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEARTBEAT.len()];
    with_deadline(timeout, "heartbeat", async {
        reader.read_exact(&mut buf).await?;
        Ok::<_, Error>(())
    })
    .await?;

    if buf != HEARTBEAT {
        return Err(Error::BadHeartbeat);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_handshake() {
        let (mut agent, mut server) = tokio::io::duplex(64);

        let (a, s) = tokio::join!(
            client_handshake(&mut agent, TIMEOUT),
            server_handshake(&mut server, TIMEOUT),
        );
        a.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_wrong_hello() {
        let (mut agent, mut server) = tokio::io::duplex(64);
        agent.write_all(b"hello serveR").await.unwrap();

        let err = server_handshake(&mut server, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::BadHandshake));
    }

    #[tokio::test]
    async fn test_server_handshake_times_out() {
        let (mut agent, mut server) = tokio::io::duplex(64);
        agent.write_all(b"hello").await.unwrap();

        let err = server_handshake(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("control handshake")));
    }

    #[tokio::test]
    async fn test_client_rejects_wrong_reply() {
        let (mut agent, mut server) = tokio::io::duplex(64);
        server.write_all(b"hello world").await.unwrap();

        let err = client_handshake(&mut agent, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::BadHandshake));
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let (mut agent, mut server) = tokio::io::duplex(64);
        agent.write_all(HEARTBEAT).await.unwrap();
        agent.write_all(b"keep alivE").await.unwrap();

        read_heartbeat(&mut server, TIMEOUT).await.unwrap();
        let err = read_heartbeat(&mut server, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::BadHeartbeat));

        drop(agent);
        let err = read_heartbeat(&mut server, TIMEOUT).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_tunnel_token_frames() {
        let first = TunnelToken::new(7, AddressRequest::domain("example.com", 80).unwrap());
        let second = TunnelToken::new(
            0x0102_0304,
            AddressRequest::from_socket_addr("192.168.1.1:8080".parse().unwrap()),
        );

        let encoded = second.encode();
        assert_eq!(&encoded[..4], &[1, 2, 3, 4]);
        assert_eq!(&encoded[4..], second.request.raw());

        let mut wire = first.encode();
        wire.extend_from_slice(&encoded);
        let mut reader = wire.as_slice();

        let a = TunnelToken::read_from(&mut reader, PortCompat::Strict).await.unwrap();
        let b = TunnelToken::read_from(&mut reader, PortCompat::Strict).await.unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
    }
}
