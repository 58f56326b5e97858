//! Pairing dialed-back tunnel connections with the requests that caused them.
//!
//! Each request registers a waiter under a fresh [`TunnelId`]. The agent
//! echoes that id in the tunnel handshake, so a tunnel connection goes to
//! the request that asked for it, never to whichever happens to be waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proto::{AddressRequest, Error, Result, TunnelId, TunnelToken};
use tokio::sync::oneshot;

struct Entry<C> {
    raw: Box<[u8]>,
    tx: oneshot::Sender<Result<C>>,
}

/// Arena of requests waiting for their tunnel connection.
pub struct PendingTunnels<C> {
    next_id: AtomicU32,
    /// `None` once the owning session is gone.
    waiting: Mutex<Option<HashMap<TunnelId, Entry<C>>>>,
}

impl<C> PendingTunnels<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(1),
            waiting: Mutex::new(Some(HashMap::new())),
        })
    }

    /// Insert a waiter for `request`.
    pub fn register(self: &Arc<Self>, request: &AddressRequest) -> Result<Waiter<C>> {
        let (tx, rx) = oneshot::channel();

        let mut waiting = self.waiting.lock();
        let map = waiting.as_mut().ok_or(Error::SessionClosed)?;
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !map.contains_key(&id) {
                break id;
            }
        };
        map.insert(
            id,
            Entry {
                raw: request.raw().into(),
                tx,
            },
        );

        Ok(Waiter {
            id,
            rx,
            arena: Arc::clone(self),
        })
    }

    /// Route a tunnel connection to its waiter.
    ///
    /// The waiter is removed either way; a handshake whose bytes differ from
    /// the registered request fails that request with
    /// [`Error::HandshakeMismatch`] and the connection is dropped.
    pub fn deliver(&self, token: &TunnelToken, conn: C) -> Result<()> {
        let entry = self
            .waiting
            .lock()
            .as_mut()
            .and_then(|map| map.remove(&token.id))
            .ok_or(Error::UnknownTunnel(token.id))?;

        if *entry.raw != *token.request.raw() {
            let _ = entry.tx.send(Err(Error::HandshakeMismatch));
            return Err(Error::HandshakeMismatch);
        }

        // The waiter may have given up between the removal and now.
        entry
            .tx
            .send(Ok(conn))
            .map_err(|_| Error::UnknownTunnel(token.id))
    }

    /// Fail every waiter with [`Error::SessionClosed`] and refuse new ones.
    pub fn close(&self) {
        let drained = self.waiting.lock().take();
        if let Some(map) = drained {
            if !map.is_empty() {
                tracing::debug!("dropping {} pending tunnel requests", map.len());
            }
        }
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.waiting.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: TunnelId) {
        if let Some(map) = self.waiting.lock().as_mut() {
            map.remove(&id);
        }
    }
}

/// A registered request. Dropping it withdraws the registration.
pub struct Waiter<C> {
    id: TunnelId,
    rx: oneshot::Receiver<Result<C>>,
    arena: Arc<PendingTunnels<C>>,
}

impl<C> Waiter<C> {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Wait for the matching tunnel connection.
    pub async fn wait(mut self) -> Result<C> {
        (&mut self.rx).await.unwrap_or(Err(Error::SessionClosed))
    }
}

impl<C> Drop for Waiter<C> {
    fn drop(&mut self) {
        self.arena.remove(self.id);
    }
}
