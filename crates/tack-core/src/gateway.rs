//! Persistence gateway boundary.
//!
//! The sequencer computes position deltas; committing them is the job of
//! the surrounding application's storage layer, reached through these
//! traits. The in-memory implementation backs tests and single-node runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A single position assignment produced by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    /// The item whose position changes.
    pub item_id: String,
    /// The new dense position within its container.
    pub position: usize,
}

impl PositionDelta {
    /// Create a new delta.
    #[must_use]
    pub fn new(item_id: impl Into<String>, position: usize) -> Self {
        Self {
            item_id: item_id.into(),
            position,
        }
    }
}

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Another writer touched the same rows; the operation may be retried.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The storage backend is unreachable or failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// A transaction over position state.
///
/// Writes are staged until `commit`; `rollback` discards them. Dropping a
/// transaction without committing has the same effect as rollback.
#[async_trait]
pub trait PositionTxn: Send {
    /// Stage position writes for one container.
    async fn write_positions(
        &mut self,
        container_id: &str,
        deltas: &[PositionDelta],
    ) -> Result<(), GatewayError>;

    /// Stage removal of an item's position row (delete, or the source side
    /// of a cross-container move).
    async fn clear_position(
        &mut self,
        container_id: &str,
        item_id: &str,
    ) -> Result<(), GatewayError>;

    /// Commit all staged writes.
    async fn commit(self: Box<Self>) -> Result<(), GatewayError>;

    /// Discard all staged writes.
    async fn rollback(self: Box<Self>) -> Result<(), GatewayError>;
}

/// Opens transactions over the position store.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Begin a transaction.
    async fn begin(&self) -> Result<Box<dyn PositionTxn>, GatewayError>;
}

enum StagedWrite {
    Positions(String, Vec<PositionDelta>),
    Clear(String, String),
}

/// In-memory gateway for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryGateway {
    positions: Arc<DashMap<String, HashMap<String, usize>>>,
}

impl MemoryGateway {
    /// Create an empty in-memory gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the committed positions for a container.
    #[must_use]
    pub fn positions(&self, container_id: &str) -> Option<HashMap<String, usize>> {
        self.positions.get(container_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn begin(&self) -> Result<Box<dyn PositionTxn>, GatewayError> {
        Ok(Box::new(MemoryTxn {
            positions: self.positions.clone(),
            staged: Vec::new(),
        }))
    }
}

struct MemoryTxn {
    positions: Arc<DashMap<String, HashMap<String, usize>>>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl PositionTxn for MemoryTxn {
    async fn write_positions(
        &mut self,
        container_id: &str,
        deltas: &[PositionDelta],
    ) -> Result<(), GatewayError> {
        self.staged.push(StagedWrite::Positions(
            container_id.to_string(),
            deltas.to_vec(),
        ));
        Ok(())
    }

    async fn clear_position(
        &mut self,
        container_id: &str,
        item_id: &str,
    ) -> Result<(), GatewayError> {
        self.staged.push(StagedWrite::Clear(
            container_id.to_string(),
            item_id.to_string(),
        ));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        for write in self.staged {
            match write {
                StagedWrite::Positions(container, deltas) => {
                    let mut entry = self.positions.entry(container).or_default();
                    for delta in deltas {
                        entry.insert(delta.item_id, delta.position);
                    }
                }
                StagedWrite::Clear(container, item) => {
                    if let Some(mut entry) = self.positions.get_mut(&container) {
                        entry.remove(&item);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
        Ok(())
    }
}
