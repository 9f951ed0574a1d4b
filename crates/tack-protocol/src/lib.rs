//! # tack-protocol
//!
//! Wire protocol for the tack realtime board sync engine.
//!
//! This crate defines the JSON messages exchanged over a board's realtime
//! channel and the validation applied to every inbound frame:
//!
//! - **Action** - the board mutation vocabulary
//! - **ClientMessage** - inbound frame shape, identity fields as claims
//! - **Event** - an accepted, validated action ready for fan-out
//! - **ServerFrame** - outbound frames (`board_update`, `user_joined`, ...)
//! - **MessageValidator** - per-connection anti-spoofing validation

pub mod message;
pub mod validate;

pub use message::{now_timestamp, Action, ClientMessage, Event, ServerFrame};
pub use validate::{MessageValidator, ValidationError};
