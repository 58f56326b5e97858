use std::time::Duration;

use proto::{with_deadline, AddressRequest, AddressType, Error, PortCompat, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const SUBAUTH_VERSION: u8 = 0x01;

const METHOD_USERNAME: u8 = 0x02;
const METHOD_DENY: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Sent as soon as the request parses, before the tunnel exists. The bound
/// address 0.0.0.0:2115 is a placeholder.
pub const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x43];

/// Username/password the proxy accepts.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Run negotiation, authentication and the CONNECT request on a fresh
/// client connection. On success the client has already been told the
/// connection succeeded.
pub async fn handshake<S>(
    client: &mut S,
    credentials: &Credentials,
    timeout: Duration,
    compat: PortCompat,
) -> Result<AddressRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(client, timeout).await?;
    authenticate(client, credentials, timeout).await?;
    read_request(client, timeout, compat).await
}

/// Method selection. Only username/password is acceptable.
///
/// ```text
/// +----+----------+----------+     +----+--------+
/// |VER | NMETHODS | METHODS  | --> |VER | METHOD |
/// +----+----------+----------+     +----+--------+
/// | 1  |    1     | 1 to 255 |     | 1  |   1    |
/// +----+----------+----------+     +----+--------+
/// ```
pub async fn negotiate<S>(client: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(timeout, "negotiation", async {
        let mut buf = [0u8; 2 + 255 + 1];
        let n = read_at_least(client, &mut buf, 2).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(Error::UnsupportedVersion(buf[0]));
        }

        let len = 2 + buf[1] as usize;
        if n < len {
            client.read_exact(&mut buf[n..len]).await?;
        } else if n > len {
            return Err(Error::ExtraData("method selection"));
        }

        let method = if buf[2..len].contains(&METHOD_USERNAME) {
            METHOD_USERNAME
        } else {
            METHOD_DENY
        };
        client.write_all(&[SOCKS_VERSION, method]).await?;

        if method == METHOD_DENY {
            return Err(Error::NoAcceptableMethod);
        }
        Ok(())
    })
    .await
}

/// Username/password sub-negotiation (RFC 1929).
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
pub async fn authenticate<S>(client: &mut S, credentials: &Credentials, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(timeout, "authentication", async {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await?;
        if header[0] != SUBAUTH_VERSION {
            return Err(Error::InvalidSubAuthVersion(header[0]));
        }

        let mut username = vec![0u8; header[1] as usize];
        client.read_exact(&mut username).await?;

        let plen = client.read_u8().await?;
        let mut password = vec![0u8; plen as usize];
        client.read_exact(&mut password).await?;

        if username != credentials.username.as_bytes() || password != credentials.password.as_bytes() {
            client.write_all(&[SUBAUTH_VERSION, 0x01]).await?;
            return Err(Error::AuthFailed);
        }
        client.write_all(&[SUBAUTH_VERSION, 0x00]).await?;
        Ok(())
    })
    .await
}

/// CONNECT request.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub async fn read_request<S>(client: &mut S, timeout: Duration, compat: PortCompat) -> Result<AddressRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(timeout, "request", async {
        let mut buf = [0u8; 3 + 1 + 1 + 255 + 2 + 1];
        // Up to the domain length byte, if there is one.
        let n = read_at_least(client, &mut buf, 5).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(Error::UnsupportedVersion(buf[0]));
        }
        if buf[1] != CMD_CONNECT {
            send_failure(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(Error::UnsupportedCommand(buf[1]));
        }

        let address_type = match AddressType::from_u8(buf[3]) {
            Ok(t) => t,
            Err(e) => {
                send_failure(client, REPLY_ADDRESS_NOT_SUPPORTED).await?;
                return Err(e);
            }
        };
        let len = 3 + address_type.token_len(buf[4]);
        if n < len {
            client.read_exact(&mut buf[n..len]).await?;
        } else if n > len {
            return Err(Error::ExtraData("request"));
        }

        let request = AddressRequest::decode_with(&buf[3..len], compat)?;
        client.write_all(&SUCCESS_REPLY).await?;
        Ok(request)
    })
    .await
}

async fn send_failure<S>(client: &mut S, rep: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    client
        .write_all(&[SOCKS_VERSION, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Read into `buf` until at least `min` bytes have arrived.
async fn read_at_least<R>(reader: &mut R, buf: &mut [u8], min: usize) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut n = 0;
    while n < min {
        let read = reader.read(&mut buf[n..]).await?;
        if read == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        n += read;
    }
    Ok(n)
}
