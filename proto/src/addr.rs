//! Address-request codec.
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! The same bytes are the tail of a SOCKS5 CONNECT request and the token the
//! server hands to the agent, so the raw encoding is kept verbatim.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Smallest possible encoding: empty domain name plus port.
pub const MIN_TOKEN_LEN: usize = 4;

/// Largest possible encoding: 255-byte domain name plus port.
pub const MAX_TOKEN_LEN: usize = 1 + 1 + 255 + 2;

/// Port value produced by a client that writes the port little-endian.
const SWAPPED_PORT: u16 = 0x8323;

/// Address type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// 4-byte IPv4 address
    Ipv4 = 0x01,
    /// Length-prefixed domain name
    DomainName = 0x03,
    /// 16-byte IPv6 address
    Ipv6 = 0x04,
}

impl AddressType {
    /// Parse an address type tag.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Ipv4),
            0x03 => Ok(Self::DomainName),
            0x04 => Ok(Self::Ipv6),
            _ => Err(Error::InvalidAddressType(v)),
        }
    }

    /// Total token length for this type. `second` is the byte after the tag,
    /// which is the name length for domain addresses and ignored otherwise.
    pub fn token_len(self, second: u8) -> usize {
        match self {
            Self::Ipv4 => 1 + 4 + 2,
            Self::Ipv6 => 1 + 16 + 2,
            Self::DomainName => 1 + 1 + second as usize + 2,
        }
    }
}

/// How the 2-byte port field is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortCompat {
    /// Big-endian, always.
    #[default]
    Strict,
    /// Big-endian, except that 33571 (0x8323) is re-read little-endian as
    /// 9091. Works around a client that sends that port byte-swapped.
    SwapLegacy,
}

impl PortCompat {
    fn port(self, bytes: [u8; 2]) -> u16 {
        let port = u16::from_be_bytes(bytes);
        match self {
            Self::SwapLegacy if port == SWAPPED_PORT => u16::from_le_bytes(bytes),
            _ => port,
        }
    }
}

/// One CONNECT target, decoded from its wire form.
///
/// `raw` is the only thing ever compared; `host` and `port` are views for
/// dialing and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    address_type: AddressType,
    host: String,
    port: u16,
    raw: Box<[u8]>,
}

impl AddressRequest {
    /// Decode with big-endian ports.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Self::decode_with(raw, PortCompat::Strict)
    }

    /// Decode the token at the start of `raw`. Bytes past the end of the
    /// token are ignored and not kept.
    pub fn decode_with(raw: &[u8], compat: PortCompat) -> Result<Self> {
        if raw.len() < MIN_TOKEN_LEN {
            return Err(Error::TooShort(raw.len()));
        }

        let address_type = AddressType::from_u8(raw[0])?;
        let len = address_type.token_len(raw[1]);
        if raw.len() < len {
            return Err(Error::Truncated {
                expected: len,
                actual: raw.len(),
            });
        }
        let raw = &raw[..len];

        let host = match address_type {
            AddressType::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&raw[1..5]);
                Ipv4Addr::from(octets).to_string()
            }
            AddressType::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[1..17]);
                Ipv6Addr::from(octets).to_string()
            }
            AddressType::DomainName => String::from_utf8_lossy(&raw[2..len - 2]).into_owned(),
        };
        let port = compat.port([raw[len - 2], raw[len - 1]]);

        Ok(Self {
            address_type,
            host,
            port,
            raw: raw.into(),
        })
    }

    /// Read exactly one token from a stream, using the type tag and, for
    /// domain names, the length byte to know where it ends.
    pub async fn read_from<R>(reader: &mut R, compat: PortCompat) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; MAX_TOKEN_LEN];
        reader.read_exact(&mut buf[..2]).await?;

        let len = AddressType::from_u8(buf[0])?.token_len(buf[1]);
        reader.read_exact(&mut buf[2..len]).await?;

        Self::decode_with(&buf[..len], compat)
    }

    /// Encode a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let mut raw = Vec::with_capacity(1 + 16 + 2);
        let address_type = match addr {
            SocketAddr::V4(v4) => {
                raw.push(AddressType::Ipv4 as u8);
                raw.extend_from_slice(&v4.ip().octets());
                AddressType::Ipv4
            }
            SocketAddr::V6(v6) => {
                raw.push(AddressType::Ipv6 as u8);
                raw.extend_from_slice(&v6.ip().octets());
                AddressType::Ipv6
            }
        };
        raw.extend_from_slice(&addr.port().to_be_bytes());

        Self {
            address_type,
            host: addr.ip().to_string(),
            port: addr.port(),
            raw: raw.into(),
        }
    }

    /// Encode a domain name. Returns `None` if the name exceeds 255 bytes.
    pub fn domain(host: &str, port: u16) -> Option<Self> {
        let len = u8::try_from(host.len()).ok()?;

        let mut raw = Vec::with_capacity(1 + 1 + host.len() + 2);
        raw.push(AddressType::DomainName as u8);
        raw.push(len);
        raw.extend_from_slice(host.as_bytes());
        raw.extend_from_slice(&port.to_be_bytes());

        Some(Self {
            address_type: AddressType::DomainName,
            host: host.to_owned(),
            port,
            raw: raw.into(),
        })
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The exact bytes this request was decoded from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// `host:port`, with IPv6 hosts bracketed, suitable for dialing.
    pub fn address(&self) -> String {
        match self.address_type {
            AddressType::Ipv6 => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for AddressRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}
