//! Event fan-out to room members.
//!
//! The broadcaster takes a membership snapshot, delivers to every member
//! except the originator, and evicts failed connections in one batch after
//! the pass completes. Delivery is at-most-once, best-effort, no retry;
//! ordering across recipients is unspecified, FIFO per connection only.

use crate::registry::RoomRegistry;
use crate::room::{Connection, ConnectionId};
use std::sync::Arc;
use tack_protocol::ServerFrame;
use tracing::{debug, warn};

/// Result of one broadcast pass.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Number of connections the frame was delivered to.
    pub delivered: usize,
    /// Connections evicted because delivery failed. Already removed from
    /// the room and closed; callers may announce their departure.
    pub evicted: Vec<Arc<Connection>>,
}

/// Fans validated frames out to a board's room.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `frame` to every member of `board_id`'s room except
    /// `exclude`, evicting connections whose delivery fails.
    pub fn publish(
        &self,
        board_id: &str,
        frame: &ServerFrame,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastOutcome {
        let members = self.registry.members(board_id);
        if members.is_empty() {
            return BroadcastOutcome::default();
        }

        let mut delivered = 0;
        let mut failed: Vec<Arc<Connection>> = Vec::new();

        for connection in members {
            if Some(connection.id()) == exclude {
                continue;
            }
            match connection.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        board = %board_id,
                        connection = %connection.id(),
                        error = %e,
                        "Delivery failed, marking for eviction"
                    );
                    failed.push(connection);
                }
            }
        }

        // Evictions happen after the fan-out pass, never mid-iteration.
        let mut evicted = Vec::with_capacity(failed.len());
        for connection in failed {
            if self
                .registry
                .disconnect(board_id, connection.id())
                .is_some()
            {
                evicted.push(connection);
            }
        }

        debug!(
            board = %board_id,
            delivered,
            evicted = evicted.len(),
            "Broadcast complete"
        );

        BroadcastOutcome { delivered, evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tack_protocol::{Action, Event};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn setup() -> (Broadcaster, Arc<RoomRegistry>) {
        let registry = Arc::new(RoomRegistry::new());
        (Broadcaster::new(registry.clone()), registry)
    }

    fn join(
        registry: &RoomRegistry,
        board: &str,
        user: &str,
    ) -> (Arc<Connection>, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(board, user, tx));
        registry.connect(conn.clone()).unwrap();
        (conn, rx)
    }

    fn move_frame(board: &str, user: &str) -> ServerFrame {
        Event::new(
            Action::MoveCard,
            serde_json::json!({"card_id": "c1", "position": 0}),
            board,
            user,
        )
        .to_frame()
    }

    #[test]
    fn test_broadcast_excludes_originator() {
        let (broadcaster, registry) = setup();
        let (_c1, mut rx1) = join(&registry, "b1", "u1");
        let (c2, mut rx2) = join(&registry, "b1", "u2");
        let (_c3, mut rx3) = join(&registry, "b1", "u3");

        let outcome = broadcaster.publish("b1", &move_frame("b1", "u2"), Some(c2.id()));
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.evicted.is_empty());

        assert!(matches!(rx1.try_recv(), Ok(ServerFrame::BoardUpdate { .. })));
        assert!(matches!(rx3.try_recv(), Ok(ServerFrame::BoardUpdate { .. })));
        assert!(rx1.try_recv().is_err(), "exactly one frame per recipient");
        assert!(rx2.try_recv().is_err(), "originator receives nothing");
    }

    #[test]
    fn test_broadcast_self_heals_on_dead_connection() {
        let (broadcaster, registry) = setup();
        let (_c1, mut rx1) = join(&registry, "b1", "u1");
        let (c2, _rx2) = join(&registry, "b1", "u2");
        let (c3, rx3) = join(&registry, "b1", "u3");

        // Simulate a transport failure on c3
        drop(rx3);

        let outcome = broadcaster.publish("b1", &move_frame("b1", "u2"), Some(c2.id()));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id(), c3.id());

        // Healthy member still got its frame, dead one is gone
        assert!(rx1.try_recv().is_ok());
        assert!(c3.is_closed());
        assert_eq!(registry.count("b1"), 2);
    }

    #[test]
    fn test_broadcast_to_empty_board_is_noop() {
        let (broadcaster, _registry) = setup();
        let outcome = broadcaster.publish("nope", &move_frame("nope", "u1"), None);
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.evicted.is_empty());
    }

    #[test]
    fn test_broadcast_without_exclusion_reaches_everyone() {
        let (broadcaster, registry) = setup();
        let (_c1, mut rx1) = join(&registry, "b1", "u1");
        let (_c2, mut rx2) = join(&registry, "b1", "u2");

        let frame = ServerFrame::user_left("u3", 2);
        let outcome = broadcaster.publish("b1", &frame, None);
        assert_eq!(outcome.delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
