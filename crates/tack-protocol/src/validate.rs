//! Inbound message validation.
//!
//! Every frame arriving on a realtime connection passes through a
//! [`MessageValidator`] bound to that connection's authenticated identity.
//! Client-declared `board_id`/`user_id` fields are checked against the
//! binding and the bound values, not the claims, flow into the produced
//! [`Event`].

use crate::message::{Action, ClientMessage, Event};
use thiserror::Error;

/// Validation failures for inbound frames.
///
/// None of these are fatal to the connection; the server replies with an
/// `error` frame and keeps the session open.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The frame is not valid JSON or is missing required fields.
    #[error("Invalid JSON format: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The declared action is not part of the protocol vocabulary.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// The declared board does not match the connection's bound board.
    #[error("Board ID mismatch")]
    BoardMismatch {
        claimed: String,
        bound: String,
    },

    /// The declared user does not match the authenticated identity.
    #[error("User ID mismatch")]
    UserMismatch {
        claimed: String,
        bound: String,
    },
}

/// Validates inbound frames against a connection's bound identity.
///
/// Constructed once per connection, at accept time, from identity supplied
/// by the external auth layer.
#[derive(Debug, Clone)]
pub struct MessageValidator {
    board_id: String,
    user_id: String,
}

impl MessageValidator {
    /// Create a validator bound to a connection identity.
    #[must_use]
    pub fn new(board_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Get the bound board id.
    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Get the bound user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Parse and validate a raw inbound frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the frame is malformed, declares an
    /// unknown action, or claims an identity other than the bound one.
    pub fn validate(&self, raw: &str) -> Result<Event, ValidationError> {
        let message: ClientMessage = serde_json::from_str(raw)?;
        self.validate_message(message)
    }

    /// Validate an already-parsed client message.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] on an unknown action or identity
    /// mismatch.
    pub fn validate_message(&self, message: ClientMessage) -> Result<Event, ValidationError> {
        let action: Action = message
            .action
            .parse()
            .map_err(|()| ValidationError::UnknownAction(message.action.clone()))?;

        if message.board_id != self.board_id {
            return Err(ValidationError::BoardMismatch {
                claimed: message.board_id,
                bound: self.board_id.clone(),
            });
        }

        if message.user_id != self.user_id {
            return Err(ValidationError::UserMismatch {
                claimed: message.user_id,
                bound: self.user_id.clone(),
            });
        }

        // Identity comes from the binding, not the (now verified) claims.
        Ok(Event {
            action,
            data: message.data,
            board_id: self.board_id.clone(),
            user_id: self.user_id.clone(),
            timestamp: message.timestamp,
        })
    }
}
