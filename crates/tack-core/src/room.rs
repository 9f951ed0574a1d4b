//! Connections and rooms.
//!
//! A room is the set of live realtime connections viewing one board. Rooms
//! carry no ordering semantics; membership is append/remove only.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tack_protocol::ServerFrame;
use tokio::sync::mpsc;
use tracing::debug;

/// Counter for unique connection ids within one process.
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from a known string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{counter:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a connection.
///
/// `Closed` is terminal; a closed connection is never re-added to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

/// Delivery failures for a single connection.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection has already transitioned to `Closed`.
    #[error("Connection is closed")]
    Closed,

    /// The outbound queue is gone; the transport writer has shut down.
    #[error("Outbound channel dropped")]
    ChannelDropped,
}

/// One live realtime session, bound to a board and an authenticated user.
///
/// Delivery goes through an unbounded per-connection queue consumed by the
/// transport writer, which gives FIFO ordering per connection. A failed
/// enqueue marks the connection closed.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    board_id: String,
    user_id: String,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    state: AtomicU8,
}

impl Connection {
    /// Create a new connection in the `Connecting` state.
    #[must_use]
    pub fn new(
        board_id: impl Into<String>,
        user_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            board_id: board_id.into(),
            user_id: user_id.into(),
            outbound,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the board this connection is bound to.
    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Get the authenticated user id bound at accept time.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    /// Check whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Transition `Connecting -> Open`. No effect once closed.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to `Closed`. Terminal.
    pub fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Enqueue a frame for delivery to this connection.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] if the connection is closed or the
    /// transport writer is gone; the latter closes the connection.
    pub fn deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.outbound.send(frame).map_err(|_| {
            self.close();
            DeliveryError::ChannelDropped
        })
    }
}

/// The live membership of one board.
#[derive(Debug, Default)]
pub struct Room {
    members: DashMap<ConnectionId, Arc<Connection>>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check membership by connection id.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.contains_key(id)
    }

    /// Add a connection to the room.
    pub fn insert(&self, connection: Arc<Connection>) {
        debug!(connection = %connection.id(), board = %connection.board_id(), "Room member added");
        self.members.insert(connection.id().clone(), connection);
    }

    /// Remove a connection from the room.
    ///
    /// Returns the removed connection, if it was a member.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.members.remove(id).map(|(_, conn)| conn)
    }

    /// Point-in-time snapshot of the membership.
    ///
    /// Broadcast iterates over this snapshot, never over the live set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.members.iter().map(|e| e.value().clone()).collect()
    }
}
