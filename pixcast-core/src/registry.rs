//! Bounded set of connected clients.
//!
//! The registry owns every [`Client`] behind an `Arc`; the scheduler
//! and the liveness sweep borrow snapshots. Removal is idempotent and
//! cancels the client's token, so its reader task exits and any send
//! still in flight fails fast.
//!
//! ```text
//!  Handshaking ──► Active ──► Closing ──► Removed
//!                    │                       ▲
//!                    └───────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::ws::connection::WsWriter;

/// Default number of simultaneous viewers.
pub const DEFAULT_MAX_CLIENTS: usize = 4;

/// Monotonically assigned client identifier.
pub type ClientId = u64;

// ── ClientState ──────────────────────────────────────────────────

/// Lifecycle of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Handshaking = 0,
    Active = 1,
    /// A close frame was sent or received.
    Closing = 2,
    Removed = 3,
}

impl ClientState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Handshaking,
            1 => ClientState::Active,
            2 => ClientState::Closing,
            _ => ClientState::Removed,
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Active => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Everything the accept loop hands to [`ClientRegistry::add`].
pub struct ClientConnection {
    /// Peer address, for logs.
    pub peer: String,
    pub writer: WsWriter,
    /// Cancelled on removal; the reader task watches it.
    pub cancel: CancellationToken,
}

/// A registered viewer.
pub struct Client {
    id: ClientId,
    peer: String,
    writer: WsWriter,
    state: AtomicU8,
    cancel: CancellationToken,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn writer(&self) -> &WsWriter {
        &self.writer
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ClientState::Active
    }

    /// permessage-deflate was negotiated.
    pub fn compression(&self) -> bool {
        self.writer.compression()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// `Active → Closing`. Returns `false` from any other state.
    pub fn begin_closing(&self) -> bool {
        self.transition(ClientState::Active, ClientState::Closing)
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("compression", &self.compression())
            .finish()
    }
}

// ── ClientRegistry ───────────────────────────────────────────────

/// The set of connected clients, capped at `max_clients`.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
    next_id: AtomicU64,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::with_capacity(max_clients)),
            next_id: AtomicU64::new(1),
            max_clients,
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly upgraded connection and mark it Active.
    pub fn add(&self, conn: ClientConnection) -> Result<ClientId, StreamError> {
        let mut clients = self.map();
        if clients.len() >= self.max_clients {
            return Err(StreamError::RegistryFull(self.max_clients));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let client = Arc::new(Client {
            id,
            peer: conn.peer,
            writer: conn.writer,
            state: AtomicU8::new(ClientState::Handshaking as u8),
            cancel: conn.cancel,
            last_seen: Mutex::new(now),
            connected_at: now,
        });
        client.transition(ClientState::Handshaking, ClientState::Active);
        info!(
            client = id,
            peer = %client.peer,
            compression = client.compression(),
            total = clients.len() + 1,
            "client registered"
        );
        clients.insert(id, client);
        Ok(id)
    }

    /// Unregister `id`. Returns `false` if it was already gone.
    pub fn remove(&self, id: ClientId) -> bool {
        let Some(client) = self.map().remove(&id) else {
            return false;
        };
        client.state.store(ClientState::Removed as u8, Ordering::Release);
        client.cancel.cancel();
        // Busy writers are dropped with the last Arc instead.
        client.writer.close();
        info!(
            client = id,
            peer = %client.peer,
            connected_secs = client.connected_for().as_secs(),
            "client removed"
        );
        true
    }

    /// Run `f` on a snapshot of the active clients. `f` may call
    /// back into the registry.
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Client>),
    {
        for client in self.active_clients() {
            f(&client);
        }
    }

    pub fn active_clients(&self) -> Vec<Arc<Client>> {
        self.map().values().filter(|c| c.is_active()).cloned().collect()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.map().get(&id).cloned()
    }

    /// Registered and still Active.
    pub fn is_valid(&self, id: ClientId) -> bool {
        self.map().get(&id).is_some_and(|c| c.is_active())
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_clients
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn has_active(&self) -> bool {
        self.map().values().any(|c| c.is_active())
    }

    /// Liveness pass: ping every active client, dropping those that
    /// fail the ping or have been silent for longer than `idle_timeout`.
    ///
    /// A busy writer is not a failure. Returns how many were removed.
    pub async fn sweep(&self, ping_wait: Duration, idle_timeout: Duration) -> usize {
        let mut removed = 0;
        for client in self.active_clients() {
            let idle = client.idle_for();
            if idle > idle_timeout {
                debug!(client = client.id, idle_ms = idle.as_millis() as u64, "client idle");
                removed += usize::from(self.remove(client.id));
                continue;
            }
            match client.writer.send_ping(&[], ping_wait).await {
                Ok(_) | Err(StreamError::WriterBusy(_)) => {}
                Err(e) => {
                    debug!(client = client.id, error = %e, "ping failed");
                    removed += usize::from(self.remove(client.id));
                }
            }
        }
        removed
    }

    /// Send `code` to every client (best effort) and remove them all.
    pub async fn close_all(&self, code: u16, wait: Duration) {
        let clients: Vec<Arc<Client>> = self.map().values().cloned().collect();
        for client in clients {
            if client.begin_closing() {
                let _ = client.writer.send_close(code, wait).await;
            }
            self.remove(client.id);
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

// ── Tests ────────────────────────────────────────────────────────
