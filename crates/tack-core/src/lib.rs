//! # tack-core
//!
//! Ordering and fan-out core for the tack realtime board sync engine.
//!
//! This crate provides the pieces with genuine concurrency concerns:
//!
//! - **Sequencer** - dense `{0..N-1}` position maintenance under
//!   concurrent reorders and cross-container moves
//! - **RoomRegistry** - per-board tracking of live connections
//! - **Broadcaster** - snapshot-based fan-out with batch eviction of
//!   failed connections
//! - **PersistenceGateway** - transaction boundary to the surrounding
//!   application's storage layer
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌───────────┐    ┌─────────────┐
//! │ Connection │───▶│ Sequencer │───▶│   Gateway   │
//! └────────────┘    └───────────┘    └─────────────┘
//!        │
//!        ▼
//! ┌────────────┐    ┌─────────────┐
//! │ Registry   │◀───│ Broadcaster │
//! └────────────┘    └─────────────┘
//! ```

pub mod broadcast;
pub mod gateway;
pub mod registry;
pub mod room;
pub mod sequencer;

pub use broadcast::{BroadcastOutcome, Broadcaster};
pub use gateway::{GatewayError, MemoryGateway, PersistenceGateway, PositionDelta, PositionTxn};
pub use registry::{RegistryConfig, RegistryError, RoomRegistry};
pub use room::{Connection, ConnectionId, ConnectionState, DeliveryError, Room};
pub use sequencer::{ContainerId, ContainerUpdate, ItemId, Sequencer, SequencerError};
