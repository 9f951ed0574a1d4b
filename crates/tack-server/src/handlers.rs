//! Realtime connection handling.
//!
//! One task per WebSocket connection reads inbound frames; a paired writer
//! task drains the connection's outbound queue into the socket. Everything
//! a client sends passes through the validator bound to the connection's
//! identity before it can touch the sequencer or the room.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rest;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tack_core::{
    Broadcaster, Connection, MemoryGateway, PersistenceGateway, RegistryConfig, RoomRegistry,
    Sequencer, SequencerError,
};
use tack_protocol::{Action, Event, MessageValidator, ServerFrame};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live room membership.
    pub registry: Arc<RoomRegistry>,
    /// Fan-out over the registry.
    pub broadcaster: Broadcaster,
    /// Position ordering.
    pub sequencer: Sequencer,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the in-memory gateway.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_gateway(config, Arc::new(MemoryGateway::new()))
    }

    /// Create app state committing positions through a specific gateway.
    #[must_use]
    pub fn with_gateway(config: Config, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(RegistryConfig {
            max_connections_per_room: config.limits.max_connections_per_room,
        }));

        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            sequencer: Sequencer::new(gateway),
            registry,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("tack server listening on {}", addr);
    info!(
        "Board endpoint: ws://{}{}/{{board_id}}",
        addr, config.realtime.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the axum router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_route = format!("{}/:board_id", state.config.realtime.websocket_path);

    Router::new()
        .route(&ws_route, get(ws_handler))
        .route(
            "/api/boards/:board_id/cards/:card_id/move",
            post(rest::move_card),
        )
        .route(
            "/api/boards/:board_id/columns/:column_id/move",
            post(rest::move_column),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Authenticated user id, supplied by the identity layer in front of
    /// this server. Bound to the connection before it joins the room.
    user: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(board_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, board_id, query.user, state))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, board_id: String, user_id: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection = Arc::new(Connection::new(&board_id, &user_id, outbound_tx));

    debug!(connection = %connection.id(), board = %board_id, user = %user_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let connected_users = match state.registry.connect(connection.clone()) {
        Ok(count) => count,
        Err(e) => {
            warn!(board = %board_id, user = %user_id, error = %e, "Connection refused");
            let frame = ServerFrame::error(e.to_string());
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = sink.send(Message::Text(text)).await;
            }
            return;
        }
    };
    metrics::set_active_rooms(state.registry.room_count());

    // Writer task: drains the per-connection queue into the socket. FIFO
    // per connection comes from this queue.
    let send_timeout = Duration::from_millis(state.config.heartbeat.send_timeout_ms);
    let writer = tokio::spawn(forward_frames(
        outbound_rx,
        sink,
        connection.clone(),
        send_timeout,
    ));

    let _ = connection.deliver(ServerFrame::connection_established(connected_users));

    let joined = state.broadcaster.publish(
        &board_id,
        &ServerFrame::user_joined(&user_id, connected_users),
        Some(connection.id()),
    );
    metrics::record_broadcast(joined.delivered, joined.evicted.len());
    announce_departures(&state, &board_id, joined.evicted);

    let validator = MessageValidator::new(&board_id, &user_id);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.len() > state.config.limits.max_frame_size {
                    metrics::record_error("frame_too_large");
                    let _ = connection.deliver(ServerFrame::error("Frame too large"));
                    continue;
                }
                handle_client_frame(&state, &connection, &validator, &text).await;
            }
            Ok(Message::Binary(_)) => {
                let _ = connection.deliver(ServerFrame::error("Binary frames not supported"));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Protocol-level keepalive, answered by the transport
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %connection.id(), "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
        if connection.is_closed() {
            break;
        }
    }

    // Deregister before anything else can reference this connection
    state.registry.disconnect(&board_id, connection.id());
    metrics::set_active_rooms(state.registry.room_count());
    writer.abort();

    let left = state.broadcaster.publish(
        &board_id,
        &ServerFrame::user_left(&user_id, state.registry.count(&board_id)),
        None,
    );
    metrics::record_broadcast(left.delivered, left.evicted.len());
    announce_departures(&state, &board_id, left.evicted);

    debug!(connection = %connection.id(), board = %board_id, "WebSocket disconnected");
}

/// Drain a connection's outbound queue into its socket sink.
///
/// A write that stalls past `send_timeout` closes the connection, so a
/// peer that stops reading is evicted on the next broadcast instead of
/// queueing frames forever.
async fn forward_frames<S>(
    mut outbound_rx: mpsc::UnboundedReceiver<ServerFrame>,
    mut sink: S,
    connection: Arc<Connection>,
    send_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "Frame encoding failed");
                continue;
            }
        };
        match timeout(send_timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                connection.close();
                break;
            }
            Err(_) => {
                warn!(connection = %connection.id(), "Socket write stalled, closing connection");
                metrics::record_error("write_stalled");
                connection.close();
                break;
            }
        }
    }
}

/// Broadcast `user_left` for every evicted connection, draining any
/// evictions those broadcasts cause in turn.
pub fn announce_departures(state: &AppState, board_id: &str, evicted: Vec<Arc<Connection>>) {
    let mut departed = evicted;
    while let Some(connection) = departed.pop() {
        let frame = ServerFrame::user_left(connection.user_id(), state.registry.count(board_id));
        let outcome = state.broadcaster.publish(board_id, &frame, None);
        metrics::record_broadcast(outcome.delivered, outcome.evicted.len());
        departed.extend(outcome.evicted);
    }
    metrics::set_active_rooms(state.registry.room_count());
}

/// Handle one inbound text frame: validate, sequence, broadcast, ack.
async fn handle_client_frame(
    state: &AppState,
    connection: &Arc<Connection>,
    validator: &MessageValidator,
    text: &str,
) {
    let event = match validator.validate(text) {
        Ok(event) => event,
        Err(e) => {
            metrics::record_error("validation");
            debug!(connection = %connection.id(), error = %e, "Frame rejected");
            let _ = connection.deliver(ServerFrame::error(e.to_string()));
            return;
        }
    };

    if let Err(e) = apply_ordering(state, &event).await {
        if matches!(e, FrameError::Sequencer(SequencerError::Conflict(_))) {
            metrics::record_sequencer_conflict();
        } else {
            metrics::record_error("ordering");
        }
        debug!(connection = %connection.id(), error = %e, "Ordering action failed");
        let _ = connection.deliver(ServerFrame::error(e.to_string()));
        return;
    }

    let outcome = state
        .broadcaster
        .publish(&event.board_id, &event.to_frame(), Some(connection.id()));
    metrics::record_broadcast(outcome.delivered, outcome.evicted.len());
    announce_departures(state, &event.board_id, outcome.evicted);

    let _ = connection.deliver(ServerFrame::ack("broadcasted"));
}

/// Failures while applying an event's ordering side effects.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The action payload is missing required ordering fields.
    #[error("Invalid {action} payload: {source}")]
    Payload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The sequencer rejected the operation.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

#[derive(Debug, Deserialize)]
struct CardRef {
    card_id: String,
    list_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CardMove {
    pub card_id: String,
    pub source_list_id: String,
    /// Absent or equal to the source for a same-list reorder.
    pub target_list_id: Option<String>,
    pub position: usize,
}

#[derive(Debug, Deserialize)]
struct ColumnRef {
    column_id: String,
}

fn payload<T: serde::de::DeserializeOwned>(
    action: &'static str,
    data: &serde_json::Value,
) -> Result<T, FrameError> {
    serde_json::from_value(data.clone()).map_err(|source| FrameError::Payload { action, source })
}

/// Run an accepted event's position changes through the sequencer.
///
/// Non-ordering actions (`update_card`, `update_column`, `cursor_move`)
/// pass through untouched.
pub async fn apply_ordering(state: &AppState, event: &Event) -> Result<(), FrameError> {
    match event.action {
        Action::MoveCard => {
            let mv: CardMove = payload("move_card", &event.data)?;
            apply_card_move(state, &mv).await?;
        }
        Action::CreateCard => {
            let card: CardRef = payload("create_card", &event.data)?;
            metrics::record_sequencer_op("insert");
            state.sequencer.insert(&card.list_id, &card.card_id).await?;
        }
        Action::DeleteCard => {
            let card: CardRef = payload("delete_card", &event.data)?;
            metrics::record_sequencer_op("remove");
            state.sequencer.remove(&card.list_id, &card.card_id).await?;
        }
        Action::CreateColumn => {
            let column: ColumnRef = payload("create_column", &event.data)?;
            metrics::record_sequencer_op("insert");
            state
                .sequencer
                .insert(&event.board_id, &column.column_id)
                .await?;
        }
        Action::DeleteColumn => {
            let column: ColumnRef = payload("delete_column", &event.data)?;
            metrics::record_sequencer_op("remove");
            state
                .sequencer
                .remove(&event.board_id, &column.column_id)
                .await?;
        }
        Action::UpdateCard | Action::UpdateColumn | Action::CursorMove => {}
    }
    Ok(())
}

pub(crate) async fn apply_card_move(state: &AppState, mv: &CardMove) -> Result<(), FrameError> {
    let target = mv.target_list_id.as_deref().unwrap_or(&mv.source_list_id);
    if target == mv.source_list_id {
        metrics::record_sequencer_op("reorder");
        state
            .sequencer
            .reorder(&mv.source_list_id, &mv.card_id, mv.position)
            .await?;
    } else {
        metrics::record_sequencer_op("move_across");
        state
            .sequencer
            .move_across(&mv.card_id, &mv.source_list_id, target, mv.position)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tack_protocol::now_timestamp;

    fn state() -> AppState {
        AppState::new(Config::default())
    }

    fn event(action: Action, data: serde_json::Value) -> Event {
        Event {
            action,
            data,
            board_id: "b1".to_string(),
            user_id: "u1".to_string(),
            timestamp: now_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_create_and_move_card_through_sequencer() {
        let state = state();

        for card in ["c1", "c2", "c3"] {
            apply_ordering(
                &state,
                &event(Action::CreateCard, json!({"card_id": card, "list_id": "l1"})),
            )
            .await
            .unwrap();
        }

        apply_ordering(
            &state,
            &event(
                Action::MoveCard,
                json!({"card_id": "c3", "source_list_id": "l1", "position": 0}),
            ),
        )
        .await
        .unwrap();

        assert_eq!(
            state.sequencer.order("l1").await.unwrap(),
            vec!["c3", "c1", "c2"]
        );
    }

    #[tokio::test]
    async fn test_cross_list_move_through_sequencer() {
        let state = state();
        state.sequencer.hydrate("l1", vec!["c1".into(), "c2".into()]);
        state.sequencer.hydrate("l2", vec!["c9".into()]);

        apply_ordering(
            &state,
            &event(
                Action::MoveCard,
                json!({
                    "card_id": "c1",
                    "source_list_id": "l1",
                    "target_list_id": "l2",
                    "position": 1
                }),
            ),
        )
        .await
        .unwrap();

        assert_eq!(state.sequencer.order("l1").await.unwrap(), vec!["c2"]);
        assert_eq!(
            state.sequencer.order("l2").await.unwrap(),
            vec!["c9", "c1"]
        );
    }

    #[tokio::test]
    async fn test_column_actions_order_within_board() {
        let state = state();

        apply_ordering(
            &state,
            &event(Action::CreateColumn, json!({"column_id": "col1"})),
        )
        .await
        .unwrap();
        apply_ordering(
            &state,
            &event(Action::CreateColumn, json!({"column_id": "col2"})),
        )
        .await
        .unwrap();

        assert_eq!(
            state.sequencer.order("b1").await.unwrap(),
            vec!["col1", "col2"]
        );

        apply_ordering(
            &state,
            &event(Action::DeleteColumn, json!({"column_id": "col1"})),
        )
        .await
        .unwrap();
        assert_eq!(state.sequencer.order("b1").await.unwrap(), vec!["col2"]);
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected() {
        let state = state();
        let result = apply_ordering(
            &state,
            &event(Action::MoveCard, json!({"card_id": "c1"})),
        )
        .await;
        assert!(matches!(result, Err(FrameError::Payload { .. })));
    }

    #[tokio::test]
    async fn test_non_ordering_actions_pass_through() {
        let state = state();
        apply_ordering(&state, &event(Action::CursorMove, json!({"x": 1, "y": 2})))
            .await
            .unwrap();
        apply_ordering(
            &state,
            &event(Action::UpdateCard, json!({"card_id": "c1", "title": "t"})),
        )
        .await
        .unwrap();
        assert_eq!(state.sequencer.container_count(), 0);
    }

    /// A sink whose writes never complete, like a peer that stopped
    /// reading its socket.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_socket_write_closes_and_evicts() {
        let state = state();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new("b1", "u1", tx));
        state.registry.connect(connection.clone()).unwrap();
        connection.deliver(ServerFrame::ack("broadcasted")).unwrap();

        forward_frames(rx, StalledSink, connection.clone(), Duration::from_secs(5)).await;
        assert!(connection.is_closed());

        // The closed connection fails delivery on the next broadcast and
        // is evicted instead of queueing frames forever.
        let outcome = state
            .broadcaster
            .publish("b1", &ServerFrame::user_joined("u2", 2), None);
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(state.registry.count("b1"), 0);
    }
}
