use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    CustomerId, ProductId, Result, SagaEventRecord, SagaExecution, SagaId, SagaState, StoreError,
    Version,
    store::{SagaMutation, SagaRepository, validate_write},
};

/// In-memory saga store.
///
/// Mirrors the PostgreSQL semantics: version-checked updates, immutable
/// terminal rows and sequenced audit events. The write lock on the saga map
/// plays the role of the row lock for `update_exclusive`.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaExecution>>>,
    events: Arc<RwLock<Vec<SagaEventRecord>>>,
    injected_conflicts: Arc<AtomicU32>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` compare-and-swap updates fail with a version
    /// conflict, as if another writer had won the race.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Replaces a stored row without any checks.
    ///
    /// Test hook for simulating stale or crashed sagas.
    pub async fn overwrite(&self, saga: SagaExecution) {
        self.sagas.write().await.insert(saga.saga_id(), saga);
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Returns the total number of audit events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Clears all sagas and events.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
        self.events.write().await.clear();
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn collect_sorted<F>(&self, filter: F) -> Vec<SagaExecution>
    where
        F: Fn(&SagaExecution) -> bool,
    {
        let store = self.sagas.read().await;
        let mut sagas: Vec<_> = store.values().filter(|s| filter(s)).cloned().collect();
        sagas.sort_by_key(|s| (s.created_at(), s.saga_id()));
        sagas
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaStore {
    async fn insert(&self, saga: &SagaExecution) -> Result<()> {
        let mut store = self.sagas.write().await;
        if store.contains_key(&saga.saga_id()) {
            return Err(StoreError::AlreadyExists(saga.saga_id()));
        }
        store.insert(saga.saga_id(), saga.clone());
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn update(
        &self,
        saga: &SagaExecution,
        expected_version: Version,
    ) -> Result<SagaExecution> {
        let saga_id = saga.saga_id();
        let mut store = self.sagas.write().await;

        let stored = store
            .get(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if stored.is_terminal() {
            return Err(StoreError::TerminalSaga {
                saga_id,
                state: stored.current_state(),
            });
        }

        if stored.version() != expected_version {
            return Err(StoreError::VersionConflict {
                saga_id,
                expected: expected_version,
                actual: stored.version(),
            });
        }

        if self.take_injected_conflict() {
            return Err(StoreError::VersionConflict {
                saga_id,
                expected: expected_version,
                actual: expected_version.next(),
            });
        }

        validate_write(stored, saga)?;

        let mut written = saga.clone();
        written.version = expected_version.next();
        store.insert(saga_id, written.clone());
        Ok(written)
    }

    async fn update_exclusive(
        &self,
        saga_id: SagaId,
        mutation: SagaMutation,
    ) -> Result<SagaExecution> {
        let mut store = self.sagas.write().await;

        let stored = store
            .get(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        let mut proposed = stored.clone();
        mutation(&mut proposed)?;
        validate_write(stored, &proposed)?;

        proposed.version = stored.version().next();
        store.insert(saga_id, proposed.clone());
        Ok(proposed)
    }

    async fn find_active(&self) -> Result<Vec<SagaExecution>> {
        Ok(self.collect_sorted(|s| !s.is_terminal()).await)
    }

    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>> {
        Ok(self.collect_sorted(|s| s.current_state() == state).await)
    }

    async fn find_active_for_key(
        &self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Vec<SagaExecution>> {
        Ok(self
            .collect_sorted(|s| {
                !s.is_terminal() && s.customer_id() == customer_id && s.product_id() == product_id
            })
            .await)
    }

    async fn append_event(&self, mut event: SagaEventRecord) -> Result<i64> {
        let mut events = self.events.write().await;
        let sequence = events.len() as i64 + 1;
        event.sequence = sequence;
        events.push(event);
        Ok(sequence)
    }

    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEventRecord>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect())
    }

    async fn state_counts(&self) -> Result<BTreeMap<SagaState, u64>> {
        let store = self.sagas.read().await;
        let mut counts = BTreeMap::new();
        for saga in store.values() {
            *counts.entry(saga.current_state()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
