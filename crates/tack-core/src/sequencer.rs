//! Dense-integer position sequencing.
//!
//! Every container (a list holding cards, or a board holding lists) keeps
//! its members at positions exactly `{0..N-1}`. The sequencer computes the
//! delta set a reorder needs, commits it through the persistence gateway,
//! and only then updates its in-memory bookkeeping.
//!
//! Operations on one container are serialized by a per-container async
//! lock; cross-container moves take both locks in a stable order so two
//! concurrent movers cannot deadlock. Operations on different containers
//! run concurrently.

use crate::gateway::{GatewayError, PersistenceGateway, PositionDelta, PositionTxn};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Identifier of an ordered container (list or board).
pub type ContainerId = String;

/// Identifier of an ordered item (card or list).
pub type ItemId = String;

/// Sequencer errors.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The container has no tracked items.
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),

    /// The item is not a member of the container.
    #[error("Item {item_id} not found in container {container_id}")]
    ItemNotFound {
        container_id: ContainerId,
        item_id: ItemId,
    },

    /// The item is already a member of the container.
    #[error("Item {item_id} already in container {container_id}")]
    DuplicateItem {
        container_id: ContainerId,
        item_id: ItemId,
    },

    /// The gateway reported a write conflict; the caller may retry.
    #[error("Position conflict, retry: {0}")]
    Conflict(String),

    /// Non-retryable persistence failure.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<GatewayError> for SequencerError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Conflict(msg) => SequencerError::Conflict(msg),
            GatewayError::Storage(msg) => SequencerError::Persistence(msg),
        }
    }
}

/// Position deltas applied to one container by an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerUpdate {
    /// The container whose positions changed.
    pub container_id: ContainerId,
    /// The `(item, new_position)` assignments written.
    pub deltas: Vec<PositionDelta>,
}

/// Maintains the dense ordering invariant for all containers.
pub struct Sequencer {
    containers: DashMap<ContainerId, Arc<Mutex<Vec<ItemId>>>>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl Sequencer {
    /// Create a sequencer committing through the given gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            containers: DashMap::new(),
            gateway,
        }
    }

    /// Seed a container's order from already-persisted state.
    ///
    /// Replaces any in-memory order for the container; no gateway write.
    pub fn hydrate(&self, container_id: impl Into<ContainerId>, items: Vec<ItemId>) {
        let container_id = container_id.into();
        debug!(container = %container_id, items = items.len(), "Hydrating container order");
        self.containers
            .insert(container_id, Arc::new(Mutex::new(items)));
    }

    /// Append an item at position `count`.
    ///
    /// Creates the container lazily on first insert.
    ///
    /// # Errors
    ///
    /// Fails if the item is already present or the commit fails.
    pub async fn insert(
        &self,
        container_id: &str,
        item_id: &str,
    ) -> Result<Vec<ContainerUpdate>, SequencerError> {
        let mut order = self.lock_or_create(container_id).await;

        if order.iter().any(|id| id == item_id) {
            return Err(SequencerError::DuplicateItem {
                container_id: container_id.to_string(),
                item_id: item_id.to_string(),
            });
        }

        let deltas = vec![PositionDelta::new(item_id, order.len())];
        let mut txn = self.gateway.begin().await?;
        stage_positions(&mut txn, container_id, &deltas).await?;
        txn.commit().await?;

        order.push(item_id.to_string());
        Ok(vec![ContainerUpdate {
            container_id: container_id.to_string(),
            deltas,
        }])
    }

    /// Remove an item and compact the trailing positions by -1.
    ///
    /// Removing the last item is a degenerate shift over zero elements.
    ///
    /// # Errors
    ///
    /// Fails if the container or item is unknown or the commit fails.
    pub async fn remove(
        &self,
        container_id: &str,
        item_id: &str,
    ) -> Result<Vec<ContainerUpdate>, SequencerError> {
        let mut order = self.lock_existing(container_id).await?;

        let index = position_of(&order, container_id, item_id)?;
        let mut new_order = order.clone();
        new_order.remove(index);
        let deltas = diff_deltas(&order, &new_order);

        let mut txn = self.gateway.begin().await?;
        if let Err(e) = txn.clear_position(container_id, item_id).await {
            let _ = txn.rollback().await;
            return Err(e.into());
        }
        stage_positions(&mut txn, container_id, &deltas).await?;
        txn.commit().await?;

        *order = new_order;
        let emptied = order.is_empty();
        drop(order);
        if emptied {
            self.drop_if_empty(container_id);
        }

        Ok(vec![ContainerUpdate {
            container_id: container_id.to_string(),
            deltas,
        }])
    }

    /// Move an item to `target_index` within its container.
    ///
    /// `target_index` is clamped to `[0, count-1]`. A move to the item's
    /// current position is a no-op and returns no updates.
    ///
    /// # Errors
    ///
    /// Fails if the container or item is unknown or the commit fails.
    pub async fn reorder(
        &self,
        container_id: &str,
        item_id: &str,
        target_index: usize,
    ) -> Result<Vec<ContainerUpdate>, SequencerError> {
        let mut order = self.lock_existing(container_id).await?;

        let current = position_of(&order, container_id, item_id)?;
        let target = target_index.min(order.len().saturating_sub(1));
        if target == current {
            return Ok(Vec::new());
        }

        let mut new_order = order.clone();
        let item = new_order.remove(current);
        new_order.insert(target, item);
        let deltas = diff_deltas(&order, &new_order);

        let mut txn = self.gateway.begin().await?;
        stage_positions(&mut txn, container_id, &deltas).await?;
        txn.commit().await?;

        debug!(
            container = %container_id,
            item = %item_id,
            from = current,
            to = target,
            shifted = deltas.len(),
            "Reordered item"
        );

        *order = new_order;
        Ok(vec![ContainerUpdate {
            container_id: container_id.to_string(),
            deltas,
        }])
    }

    /// Move an item from one container to another, closing the gap in the
    /// source and opening a slot at `dest_index` in the destination.
    ///
    /// `dest_index` is clamped to `[0, dest_count]` where `dest_count` is
    /// the destination size before insertion. When source and destination
    /// are the same container this degrades to [`Sequencer::reorder`].
    ///
    /// # Errors
    ///
    /// Fails if the source container or item is unknown, the item is
    /// already in the destination, or the commit fails. The destination
    /// container is created lazily.
    pub async fn move_across(
        &self,
        item_id: &str,
        source_container_id: &str,
        dest_container_id: &str,
        dest_index: usize,
    ) -> Result<Vec<ContainerUpdate>, SequencerError> {
        if source_container_id == dest_container_id {
            return self.reorder(source_container_id, item_id, dest_index).await;
        }

        // Stable lock order keeps concurrent cross-moves deadlock-free.
        let (mut source, mut dest) = loop {
            let source_handle = self.existing(source_container_id)?;
            let dest_handle = self.handle_or_create(dest_container_id);

            let (s, d) = if source_container_id <= dest_container_id {
                let s = source_handle.clone().lock_owned().await;
                let d = dest_handle.clone().lock_owned().await;
                (s, d)
            } else {
                let d = dest_handle.clone().lock_owned().await;
                let s = source_handle.clone().lock_owned().await;
                (s, d)
            };
            if self.is_current(source_container_id, &source_handle)
                && self.is_current(dest_container_id, &dest_handle)
            {
                break (s, d);
            }
        };

        let index = match position_of(&source, source_container_id, item_id) {
            Ok(index) => index,
            Err(e) => {
                drop(source);
                drop(dest);
                self.drop_if_empty(dest_container_id);
                return Err(e);
            }
        };

        if dest.iter().any(|id| id == item_id) {
            return Err(SequencerError::DuplicateItem {
                container_id: dest_container_id.to_string(),
                item_id: item_id.to_string(),
            });
        }

        let mut new_source = source.clone();
        new_source.remove(index);
        let source_deltas = diff_deltas(&source, &new_source);

        let slot = dest_index.min(dest.len());
        let mut new_dest = dest.clone();
        new_dest.insert(slot, item_id.to_string());
        let dest_deltas = diff_deltas(&dest, &new_dest);

        let mut txn = self.gateway.begin().await?;
        if let Err(e) = txn.clear_position(source_container_id, item_id).await {
            let _ = txn.rollback().await;
            return Err(e.into());
        }
        stage_positions(&mut txn, source_container_id, &source_deltas).await?;
        stage_positions(&mut txn, dest_container_id, &dest_deltas).await?;
        txn.commit().await?;

        debug!(
            item = %item_id,
            source = %source_container_id,
            dest = %dest_container_id,
            slot,
            "Moved item across containers"
        );

        *source = new_source;
        *dest = new_dest;
        let source_emptied = source.is_empty();
        drop(source);
        drop(dest);
        if source_emptied {
            self.drop_if_empty(source_container_id);
        }

        Ok(vec![
            ContainerUpdate {
                container_id: source_container_id.to_string(),
                deltas: source_deltas,
            },
            ContainerUpdate {
                container_id: dest_container_id.to_string(),
                deltas: dest_deltas,
            },
        ])
    }

    /// Current order of a container's items, if tracked.
    pub async fn order(&self, container_id: &str) -> Option<Vec<ItemId>> {
        let handle = self.containers.get(container_id)?.clone();
        let order = handle.lock().await;
        Some(order.clone())
    }

    /// Number of items in a container.
    pub async fn len(&self, container_id: &str) -> usize {
        match self.order(container_id).await {
            Some(order) => order.len(),
            None => 0,
        }
    }

    /// Number of tracked containers.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn handle_or_create(&self, container_id: &str) -> Arc<Mutex<Vec<ItemId>>> {
        self.containers
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    fn existing(&self, container_id: &str) -> Result<Arc<Mutex<Vec<ItemId>>>, SequencerError> {
        self.containers
            .get(container_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SequencerError::ContainerNotFound(container_id.to_string()))
    }

    fn drop_if_empty(&self, container_id: &str) {
        self.containers.remove_if(container_id, |_, handle| {
            handle.try_lock().map(|g| g.is_empty()).unwrap_or(false)
        });
    }

    /// Lock a container, creating the entry if absent.
    ///
    /// The entry can be removed by `drop_if_empty` between fetching the
    /// handle and acquiring the lock; re-check after locking and retry on
    /// a stale handle so a write never lands in a container the map no
    /// longer reaches.
    async fn lock_or_create(&self, container_id: &str) -> OwnedMutexGuard<Vec<ItemId>> {
        loop {
            let handle = self.handle_or_create(container_id);
            let guard = handle.clone().lock_owned().await;
            if self.is_current(container_id, &handle) {
                return guard;
            }
        }
    }

    /// Lock an existing container, retrying past handles whose entry was
    /// removed between fetch and lock.
    async fn lock_existing(
        &self,
        container_id: &str,
    ) -> Result<OwnedMutexGuard<Vec<ItemId>>, SequencerError> {
        loop {
            let handle = self.existing(container_id)?;
            let guard = handle.clone().lock_owned().await;
            if self.is_current(container_id, &handle) {
                return Ok(guard);
            }
        }
    }

    fn is_current(&self, container_id: &str, handle: &Arc<Mutex<Vec<ItemId>>>) -> bool {
        self.containers
            .get(container_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), handle))
    }
}

fn position_of(
    order: &[ItemId],
    container_id: &str,
    item_id: &str,
) -> Result<usize, SequencerError> {
    order
        .iter()
        .position(|id| id == item_id)
        .ok_or_else(|| SequencerError::ItemNotFound {
            container_id: container_id.to_string(),
            item_id: item_id.to_string(),
        })
}

/// Deltas for every item whose position differs between `old` and `new`.
fn diff_deltas(old: &[ItemId], new: &[ItemId]) -> Vec<PositionDelta> {
    let old_positions: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    new.iter()
        .enumerate()
        .filter(|(i, id)| old_positions.get(id.as_str()).copied() != Some(*i))
        .map(|(i, id)| PositionDelta::new(id.clone(), i))
        .collect()
}

/// Stage a container's deltas; an uncommitted txn dies with its writes.
async fn stage_positions(
    txn: &mut Box<dyn PositionTxn>,
    container_id: &str,
    deltas: &[PositionDelta],
) -> Result<(), SequencerError> {
    if deltas.is_empty() {
        return Ok(());
    }
    txn.write_positions(container_id, deltas).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use async_trait::async_trait;

    fn sequencer() -> (Sequencer, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        (Sequencer::new(gateway.clone()), gateway)
    }

    async fn seed(seq: &Sequencer, container: &str, items: &[&str]) {
        for item in items {
            seq.insert(container, item).await.unwrap();
        }
    }

    /// The committed positions of a container must be exactly {0..N-1} and
    /// agree with the in-memory order.
    async fn assert_dense(seq: &Sequencer, gateway: &MemoryGateway, container: &str) {
        let order = seq.order(container).await.unwrap_or_default();
        let committed = gateway.positions(container).unwrap_or_default();
        assert_eq!(committed.len(), order.len(), "committed rows match order");
        for (expected, item) in order.iter().enumerate() {
            assert_eq!(
                committed.get(item.as_str()).copied(),
                Some(expected),
                "item {item} at dense position {expected} in {container}"
            );
        }
    }

    #[tokio::test]
    async fn test_insert_appends_at_count() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["a", "b", "c"]).await;

        assert_eq!(seq.order("L").await.unwrap(), vec!["a", "b", "c"]);
        assert_dense(&seq, &gateway, "L").await;
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let (seq, _) = sequencer();
        seed(&seq, "L", &["a"]).await;
        assert!(matches!(
            seq.insert("L", "a").await,
            Err(SequencerError::DuplicateItem { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_compacts_trailing_positions() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["a", "b", "c", "d"]).await;

        let updates = seq.remove("L", "b").await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["a", "c", "d"]);
        assert_eq!(
            updates[0].deltas,
            vec![PositionDelta::new("c", 1), PositionDelta::new("d", 2)]
        );
        assert_dense(&seq, &gateway, "L").await;
    }

    #[tokio::test]
    async fn test_remove_last_item_is_degenerate_shift() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["a", "b"]).await;

        let updates = seq.remove("L", "b").await.unwrap();
        assert!(updates[0].deltas.is_empty());
        assert_dense(&seq, &gateway, "L").await;

        // Emptying a container drops it
        seq.remove("L", "a").await.unwrap();
        assert_eq!(seq.container_count(), 0);
        assert!(matches!(
            seq.remove("L", "a").await,
            Err(SequencerError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_list_reorder_scenario() {
        // L = [A@0, B@1, C@2]; reorder(L, C, 0) => [C@0, A@1, B@2]
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B", "C"]).await;

        seq.reorder("L", "C", 0).await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["C", "A", "B"]);
        assert_dense(&seq, &gateway, "L").await;
    }

    #[tokio::test]
    async fn test_reorder_later_shifts_down() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B", "C", "D"]).await;

        seq.reorder("L", "A", 2).await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["B", "C", "A", "D"]);
        assert_dense(&seq, &gateway, "L").await;
    }

    #[tokio::test]
    async fn test_reorder_to_current_position_is_noop() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B", "C"]).await;

        let updates = seq.reorder("L", "B", 1).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(seq.order("L").await.unwrap(), vec!["A", "B", "C"]);
        assert_dense(&seq, &gateway, "L").await;
    }

    #[tokio::test]
    async fn test_reorder_clamps_target_index() {
        let (seq, _) = sequencer();
        seed(&seq, "L", &["A", "B", "C"]).await;

        seq.reorder("L", "A", 99).await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_cross_container_move_scenario() {
        // L = [A@0, B@1, C@2]; M = [X@0, Y@1]
        // move_across(C, L, M, 0) => L = [A@0, B@1], M = [C@0, X@1, Y@2]
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B", "C"]).await;
        seed(&seq, "M", &["X", "Y"]).await;

        seq.move_across("C", "L", "M", 0).await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["A", "B"]);
        assert_eq!(seq.order("M").await.unwrap(), vec!["C", "X", "Y"]);
        assert_dense(&seq, &gateway, "L").await;
        assert_dense(&seq, &gateway, "M").await;
    }

    #[tokio::test]
    async fn test_move_across_clamps_to_append() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B"]).await;
        seed(&seq, "M", &["X"]).await;

        seq.move_across("A", "L", "M", 42).await.unwrap();
        assert_eq!(seq.order("M").await.unwrap(), vec!["X", "A"]);
        assert_dense(&seq, &gateway, "M").await;
    }

    #[tokio::test]
    async fn test_move_across_same_container_degrades_to_reorder() {
        let (seq, _) = sequencer();
        seed(&seq, "L", &["A", "B", "C"]).await;

        seq.move_across("C", "L", "L", 0).await.unwrap();
        assert_eq!(seq.order("L").await.unwrap(), vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_move_across_unknown_item() {
        let (seq, _) = sequencer();
        seed(&seq, "L", &["A"]).await;

        assert!(matches!(
            seq.move_across("Z", "L", "M", 0).await,
            Err(SequencerError::ItemNotFound { .. })
        ));
        // Lazily-created destination stays empty and untracked
        assert_eq!(seq.len("M").await, 0);
        assert_eq!(seq.container_count(), 1);
    }

    #[tokio::test]
    async fn test_move_across_duplicate_in_destination_rejected() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["A", "B"]).await;
        seed(&seq, "M", &["A", "X"]).await;

        assert!(matches!(
            seq.move_across("A", "L", "M", 0).await,
            Err(SequencerError::DuplicateItem { .. })
        ));
        assert_eq!(seq.order("L").await.unwrap(), vec!["A", "B"]);
        assert_eq!(seq.order("M").await.unwrap(), vec!["A", "X"]);
        assert_dense(&seq, &gateway, "L").await;
        assert_dense(&seq, &gateway, "M").await;
    }

    #[tokio::test]
    async fn test_invariant_after_operation_sequence() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["a", "b", "c", "d", "e"]).await;
        seed(&seq, "M", &["x", "y"]).await;

        seq.reorder("L", "d", 0).await.unwrap();
        seq.move_across("b", "L", "M", 1).await.unwrap();
        seq.remove("L", "a").await.unwrap();
        seq.insert("M", "z").await.unwrap();
        seq.reorder("M", "z", 0).await.unwrap();
        seq.move_across("x", "M", "L", 3).await.unwrap();

        assert_dense(&seq, &gateway, "L").await;
        assert_dense(&seq, &gateway, "M").await;
    }

    #[tokio::test]
    async fn test_hydrate_seeds_existing_order() {
        let (seq, _) = sequencer();
        seq.hydrate("L", vec!["a".into(), "b".into()]);
        assert_eq!(seq.order("L").await.unwrap(), vec!["a", "b"]);
        assert_eq!(seq.len("L").await, 2);
    }

    struct ConflictGateway;

    #[async_trait]
    impl PersistenceGateway for ConflictGateway {
        async fn begin(&self) -> Result<Box<dyn PositionTxn>, GatewayError> {
            Ok(Box::new(ConflictTxn))
        }
    }

    struct ConflictTxn;

    #[async_trait]
    impl PositionTxn for ConflictTxn {
        async fn write_positions(
            &mut self,
            _container_id: &str,
            _deltas: &[PositionDelta],
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn clear_position(
            &mut self,
            _container_id: &str,
            _item_id: &str,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
            Err(GatewayError::Conflict("serialization failure".into()))
        }

        async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retryable_and_leaves_order_unchanged() {
        let seq = Sequencer::new(Arc::new(ConflictGateway));
        seq.hydrate("L", vec!["A".into(), "B".into(), "C".into()]);

        match seq.reorder("L", "C", 0).await {
            Err(SequencerError::Conflict(_)) => {}
            other => panic!("Expected Conflict, got {:?}", other),
        }
        // Memory only mutates after a successful commit
        assert_eq!(seq.order("L").await.unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_container_drop_and_recreate_stays_consistent() {
        let (seq, gateway) = sequencer();
        let seq = Arc::new(seq);

        // Each task repeatedly empties and refills the same container, so
        // the map entry is dropped and recreated under contention. A handle
        // fetched just before its entry is dropped must never commit into a
        // container the map no longer reaches; if it did, a later remove
        // would miss the item and the committed rows would drift from the
        // in-memory order.
        let mut handles = Vec::new();
        for task in 0..4 {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move {
                let item = format!("item-{task}");
                for _ in 0..50 {
                    seq.insert("L", &item).await.unwrap();
                    seq.remove("L", &item).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_dense(&seq, &gateway, "L").await;
        assert_eq!(seq.container_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_reorders_serialize_per_container() {
        let (seq, gateway) = sequencer();
        seed(&seq, "L", &["a", "b", "c", "d", "e", "f"]).await;
        let seq = Arc::new(seq);

        let mut handles = Vec::new();
        for (item, target) in [("a", 5), ("f", 0), ("c", 2), ("e", 1)] {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move {
                seq.reorder("L", item, target).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_dense(&seq, &gateway, "L").await;
    }
}
