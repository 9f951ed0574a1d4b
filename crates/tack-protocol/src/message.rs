//! Message types for the tack protocol.
//!
//! Clients send JSON objects describing board actions; the server replies
//! with typed frames. All frames are plain JSON text over the realtime
//! channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Board actions a client can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateCard,
    UpdateCard,
    DeleteCard,
    MoveCard,
    CreateColumn,
    UpdateColumn,
    DeleteColumn,
    /// Presence-style cursor sharing; broadcast only, never persisted.
    CursorMove,
}

impl Action {
    /// Get the wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateCard => "create_card",
            Action::UpdateCard => "update_card",
            Action::DeleteCard => "delete_card",
            Action::MoveCard => "move_card",
            Action::CreateColumn => "create_column",
            Action::UpdateColumn => "update_column",
            Action::DeleteColumn => "delete_column",
            Action::CursorMove => "cursor_move",
        }
    }

    /// Whether the action mutates board state (as opposed to ephemeral
    /// presence traffic like cursor positions).
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Action::CursorMove)
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_card" => Ok(Action::CreateCard),
            "update_card" => Ok(Action::UpdateCard),
            "delete_card" => Ok(Action::DeleteCard),
            "move_card" => Ok(Action::MoveCard),
            "create_column" => Ok(Action::CreateColumn),
            "update_column" => Ok(Action::UpdateColumn),
            "delete_column" => Ok(Action::DeleteColumn),
            "cursor_move" => Ok(Action::CursorMove),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time as float seconds since the epoch, matching the wire format.
#[must_use]
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// An inbound client message, as declared on the wire.
///
/// The identity fields (`board_id`, `user_id`) are client claims and must be
/// checked against the connection's bound identity before the message is
/// accepted. See [`crate::validate::MessageValidator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Declared action name. Kept as a string so unknown actions can be
    /// rejected with a dedicated error rather than a generic parse failure.
    pub action: String,
    /// Action-specific payload.
    pub data: serde_json::Value,
    /// Declared board id.
    pub board_id: String,
    /// Declared user id.
    pub user_id: String,
    /// Client-side timestamp, seconds since epoch.
    #[serde(default = "now_timestamp")]
    pub timestamp: f64,
}

/// An accepted, validated board action ready for fan-out.
///
/// Immutable once constructed. The identity fields come from the connection
/// binding, never from client claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The validated action.
    pub action: Action,
    /// Action-specific payload.
    pub data: serde_json::Value,
    /// Board the event applies to.
    pub board_id: String,
    /// User that originated the event.
    pub user_id: String,
    /// Seconds since epoch.
    pub timestamp: f64,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(
        action: Action,
        data: serde_json::Value,
        board_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            action,
            data,
            board_id: board_id.into(),
            user_id: user_id.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Build the outbound `board_update` frame for this event.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::BoardUpdate {
            action: self.action,
            data: self.data.clone(),
            user_id: self.user_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Outbound server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent to a client right after it joins a room.
    ConnectionEstablished {
        /// Number of connections currently in the room, including this one.
        connected_users: usize,
    },

    /// A new user joined the room.
    UserJoined {
        user_id: String,
        connected_users: usize,
    },

    /// A user left the room (disconnect or eviction).
    UserLeft {
        user_id: String,
        connected_users: usize,
    },

    /// An accepted board mutation from another viewer.
    BoardUpdate {
        action: Action,
        data: serde_json::Value,
        user_id: String,
        timestamp: f64,
    },

    /// Confirmation to the originator that its event was broadcast.
    Ack { status: String },

    /// Validation or processing error; the connection stays open.
    Error { message: String },
}

impl ServerFrame {
    /// Create a `connection_established` frame.
    #[must_use]
    pub fn connection_established(connected_users: usize) -> Self {
        ServerFrame::ConnectionEstablished { connected_users }
    }

    /// Create a `user_joined` frame.
    #[must_use]
    pub fn user_joined(user_id: impl Into<String>, connected_users: usize) -> Self {
        ServerFrame::UserJoined {
            user_id: user_id.into(),
            connected_users,
        }
    }

    /// Create a `user_left` frame.
    #[must_use]
    pub fn user_left(user_id: impl Into<String>, connected_users: usize) -> Self {
        ServerFrame::UserLeft {
            user_id: user_id.into(),
            connected_users,
        }
    }

    /// Create an `ack` frame.
    #[must_use]
    pub fn ack(status: impl Into<String>) -> Self {
        ServerFrame::Ack {
            status: status.into(),
        }
    }

    /// Create an `error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_roundtrip() {
        for action in [
            Action::CreateCard,
            Action::MoveCard,
            Action::DeleteColumn,
            Action::CursorMove,
        ] {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
        assert!("drop_table".parse::<Action>().is_err());
    }

    #[test]
    fn test_cursor_move_is_not_a_mutation() {
        assert!(!Action::CursorMove.is_mutation());
        assert!(Action::MoveCard.is_mutation());
    }

    #[test]
    fn test_client_message_parse() {
        let raw = json!({
            "action": "move_card",
            "data": {"card_id": "c1", "position": 2},
            "board_id": "b1",
            "user_id": "u1",
            "timestamp": 1700000000.5
        });

        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.action, "move_card");
        assert_eq!(msg.board_id, "b1");
        assert_eq!(msg.timestamp, 1700000000.5);
    }

    #[test]
    fn test_client_message_default_timestamp() {
        let raw = json!({
            "action": "cursor_move",
            "data": {},
            "board_id": "b1",
            "user_id": "u1"
        });

        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.timestamp > 0.0);
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let frame = ServerFrame::user_joined("u2", 3);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "user_joined");
        assert_eq!(value["user_id"], "u2");
        assert_eq!(value["connected_users"], 3);

        let update = Event::new(Action::MoveCard, json!({"card_id": "c1"}), "b1", "u1").to_frame();
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "board_update");
        assert_eq!(value["action"], "move_card");
        assert_eq!(value["user_id"], "u1");
    }

    #[test]
    fn test_server_frame_roundtrip() {
        let frames = vec![
            ServerFrame::connection_established(1),
            ServerFrame::user_left("u3", 0),
            ServerFrame::ack("broadcasted"),
            ServerFrame::error("Board ID mismatch"),
        ];

        for frame in frames {
            let encoded = serde_json::to_string(&frame).unwrap();
            let decoded: ServerFrame = serde_json::from_str(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }
}
