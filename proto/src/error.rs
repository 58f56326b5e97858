//! Error types shared by the server and the agent.

use thiserror::Error;

/// Result type alias for backhaul operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while speaking SOCKS5, the control protocol or the
/// tunnel handshake.
#[derive(Error, Debug)]
pub enum Error {
    /// Address request shorter than the smallest possible encoding
    #[error("address request too short: {0} bytes")]
    TooShort(usize),

    /// Address request ends before the length implied by its type
    #[error("address request truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Address type tag outside {IPv4, domain, IPv6}
    #[error("invalid address type: 0x{0:02x}")]
    InvalidAddressType(u8),

    /// SOCKS version other than 5
    #[error("unsupported socks version: {0}")]
    UnsupportedVersion(u8),

    /// More bytes arrived than the message length allows
    #[error("unexpected extra data after {0} message")]
    ExtraData(&'static str),

    /// Client did not offer username/password authentication
    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Username/password sub-negotiation version other than 1
    #[error("invalid username/password sub-auth version: {0}")]
    InvalidSubAuthVersion(u8),

    /// Credentials did not match
    #[error("invalid username/password")]
    AuthFailed,

    /// SOCKS command other than CONNECT
    #[error("unsupported socks command: {0}")]
    UnsupportedCommand(u8),

    /// Control handshake token did not match
    #[error("bad control handshake")]
    BadHandshake,

    /// Control connection carried something other than the heartbeat token
    #[error("bad heartbeat frame")]
    BadHeartbeat,

    /// Tunnel handshake bytes differ from the request that asked for it
    #[error("tunnel handshake does not match request")]
    HandshakeMismatch,

    /// Tunnel handshake names a request nobody is waiting for
    #[error("no pending request for tunnel {0}")]
    UnknownTunnel(u32),

    /// No agent is registered
    #[error("no active control session")]
    NoSession,

    /// The control session went away while a request depended on it
    #[error("control session closed")]
    SessionClosed,

    /// A session is active and the policy forbids replacing it
    #[error("control session already active")]
    SessionBusy,

    /// A protocol phase did not finish in time
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if the peer broke the protocol, as opposed to a transport failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::TooShort(_)
                | Error::Truncated { .. }
                | Error::InvalidAddressType(_)
                | Error::UnsupportedVersion(_)
                | Error::ExtraData(_)
                | Error::InvalidSubAuthVersion(_)
                | Error::UnsupportedCommand(_)
                | Error::BadHandshake
                | Error::BadHeartbeat
                | Error::HandshakeMismatch
                | Error::UnknownTunnel(_)
        )
    }

    /// Check if this is a clean end-of-stream from the peer.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::InvalidAddressType(7).to_string(), "invalid address type: 0x07");
        assert_eq!(Error::Timeout("negotiation").to_string(), "timed out during negotiation");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::HandshakeMismatch.is_protocol_violation());
        assert!(Error::UnsupportedCommand(2).is_protocol_violation());
        assert!(!Error::AuthFailed.is_protocol_violation());
        assert!(!Error::NoSession.is_protocol_violation());

        let eof = Error::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_eof());
        assert!(!Error::SessionClosed.is_eof());
    }
}
