//! Room registry: per-board tracking of live realtime connections.
//!
//! The registry is an explicitly constructed instance injected into the
//! server state, not an ambient singleton. Rooms are created lazily on first
//! connection and destroyed when they become empty.

use crate::room::{Connection, ConnectionId, Room};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A closed connection can never be (re-)added to a room.
    #[error("Connection is closed")]
    ClosedConnection,

    /// The room has reached its configured connection cap.
    #[error("Room {board_id} is full (limit {limit})")]
    RoomFull { board_id: String, limit: usize },
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum connections per room. `0` means unlimited.
    pub max_connections_per_room: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_room: 0,
        }
    }
}

/// Tracks the set of live connections per board.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            config,
        }
    }

    /// Add a connection to its board's room, creating the room if absent.
    ///
    /// Marks the connection open and returns the room size after the join.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the room is full.
    pub fn connect(&self, connection: Arc<Connection>) -> Result<usize, RegistryError> {
        if connection.is_closed() {
            return Err(RegistryError::ClosedConnection);
        }

        let board_id = connection.board_id().to_string();
        let room = self
            .rooms
            .entry(board_id.clone())
            .or_insert_with(|| {
                debug!(board = %board_id, "Creating room");
                Arc::new(Room::new())
            })
            .clone();

        let limit = self.config.max_connections_per_room;
        if limit > 0 && room.len() >= limit {
            return Err(RegistryError::RoomFull { board_id, limit });
        }

        connection.mark_open();
        room.insert(connection);

        let count = room.len();
        debug!(board = %board_id, connections = count, "Client connected");
        Ok(count)
    }

    /// Remove a connection from its room, deleting the room if it empties.
    ///
    /// Closes the connection and returns it if it was registered.
    pub fn disconnect(&self, board_id: &str, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.rooms.get(board_id).and_then(|room| room.remove(id));

        if let Some(conn) = &removed {
            conn.close();
            debug!(board = %board_id, connection = %id, "Client disconnected");

            self.rooms.remove_if(board_id, |_, room| room.is_empty());
            if !self.rooms.contains_key(board_id) {
                debug!(board = %board_id, "Room deleted");
            }
        }

        removed
    }

    /// Point-in-time snapshot of a room's connections.
    ///
    /// Returns an empty vec for an unknown board.
    #[must_use]
    pub fn members(&self, board_id: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .get(board_id)
            .map(|room| room.snapshot())
            .unwrap_or_default()
    }

    /// Number of connections in a room.
    #[must_use]
    pub fn count(&self, board_id: &str) -> usize {
        self.rooms.get(board_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
