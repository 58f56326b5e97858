//! Wire protocol shared by the backhaul server and agent.
//!
//! The server exposes a SOCKS5 port to ordinary clients; the agent, which
//! only ever dials out, registers over a control connection and opens one
//! tunnel connection back to the server per proxied stream.
//!
//! ```text
//! socks client ──► server ══ control ══ agent
//!                    ▲                    │
//!                    └──── tunnel ◄───────┴──► target
//! ```

pub mod addr;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod pump;

use std::future::Future;
use std::time::Duration;

pub use addr::{AddressRequest, AddressType, PortCompat};
pub use config::{Config, SessionPolicy};
pub use control::{TunnelId, TunnelToken};
pub use error::{Error, Result};
pub use pump::{pump, PumpStats};

/// Run `fut`, failing with [`Error::Timeout`] naming `phase` if it does not
/// finish within `timeout`.
pub async fn with_deadline<T, F>(timeout: Duration, phase: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(phase)),
    }
}
