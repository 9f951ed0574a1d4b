//! REST-origin move endpoints.
//!
//! Plain HTTP moves run through the same sequencer as realtime ones and
//! must end with a broadcast, so connected viewers of the board never
//! diverge from REST clients. Authorization happens upstream; the
//! authenticated user id arrives in the request body.

use crate::handlers::{self, AppState, CardMove, FrameError};
use crate::metrics;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tack_core::SequencerError;
use tack_protocol::{Action, Event};
use tracing::debug;

/// Body of `POST /api/boards/{board_id}/cards/{card_id}/move`.
#[derive(Debug, Deserialize)]
pub struct MoveCardRequest {
    /// Authenticated user performing the move.
    pub user_id: String,
    /// List currently holding the card.
    pub source_list_id: String,
    /// Destination list; absent for a same-list reorder.
    pub target_list_id: Option<String>,
    /// Requested index in the destination.
    pub position: usize,
}

/// Body of `POST /api/boards/{board_id}/columns/{column_id}/move`.
#[derive(Debug, Deserialize)]
pub struct MoveColumnRequest {
    /// Authenticated user performing the move.
    pub user_id: String,
    /// Requested index within the board.
    pub position: usize,
}

#[derive(Debug, Serialize)]
pub struct MoveResponse {
    pub status: &'static str,
}

/// Error envelope for the REST surface.
#[derive(Debug)]
pub struct ApiError(FrameError);

impl From<FrameError> for ApiError {
    fn from(e: FrameError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FrameError::Payload { .. } => StatusCode::BAD_REQUEST,
            FrameError::Sequencer(e) => match e {
                SequencerError::ContainerNotFound(_) | SequencerError::ItemNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                SequencerError::DuplicateItem { .. } => StatusCode::CONFLICT,
                SequencerError::Conflict(_) => StatusCode::CONFLICT,
                SequencerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        if matches!(
            self.0,
            FrameError::Sequencer(SequencerError::Conflict(_))
        ) {
            metrics::record_sequencer_conflict();
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Move a card, then broadcast the equivalent `board_update`.
pub async fn move_card(
    Path((board_id, card_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<MoveCardRequest>,
) -> Result<Json<MoveResponse>, ApiError> {
    let mv = CardMove {
        card_id: card_id.clone(),
        source_list_id: request.source_list_id.clone(),
        target_list_id: request.target_list_id.clone(),
        position: request.position,
    };
    handlers::apply_card_move(&state, &mv).await?;

    let event = Event::new(
        Action::MoveCard,
        json!({
            "card_id": card_id,
            "source_list_id": request.source_list_id,
            "target_list_id": request.target_list_id,
            "position": request.position,
        }),
        &board_id,
        &request.user_id,
    );
    publish(&state, &event);

    debug!(board = %board_id, card = %card_id, user = %request.user_id, "REST card move applied");
    Ok(Json(MoveResponse { status: "ok" }))
}

/// Move a column within its board, then broadcast the equivalent
/// `board_update`.
pub async fn move_column(
    Path((board_id, column_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<MoveColumnRequest>,
) -> Result<Json<MoveResponse>, ApiError> {
    metrics::record_sequencer_op("reorder");
    state
        .sequencer
        .reorder(&board_id, &column_id, request.position)
        .await
        .map_err(FrameError::from)?;

    let event = Event::new(
        Action::UpdateColumn,
        json!({
            "column_id": column_id,
            "position": request.position,
        }),
        &board_id,
        &request.user_id,
    );
    publish(&state, &event);

    debug!(board = %board_id, column = %column_id, user = %request.user_id, "REST column move applied");
    Ok(Json(MoveResponse { status: "ok" }))
}

fn publish(state: &AppState, event: &Event) {
    let outcome = state
        .broadcaster
        .publish(&event.board_id, &event.to_frame(), None);
    metrics::record_broadcast(outcome.delivered, outcome.evicted.len());
    handlers::announce_departures(state, &event.board_id, outcome.evicted);
}
