use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    CustomerId, ProductId, Result, SagaEventRecord, SagaExecution, SagaId, SagaState, StoreError,
    Version,
};

/// A read-modify-write applied while the row is exclusively locked.
pub type SagaMutation = Box<dyn FnOnce(&mut SagaExecution) -> Result<()> + Send>;

/// Core trait for saga persistence.
///
/// Every write is version-checked: `update` is a compare-and-swap on the
/// `version` column and `update_exclusive` holds a row lock for the whole
/// read-modify-write. Both reject writes to terminal rows and state changes
/// the transition table does not allow.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts a new saga.
    ///
    /// Fails with `AlreadyExists` if the ID is taken.
    async fn insert(&self, saga: &SagaExecution) -> Result<()>;

    /// Loads a saga by ID.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>>;

    /// Writes `saga` if the stored row is still at `expected_version`.
    ///
    /// Returns the stored row, whose version is `expected_version.next()`.
    /// A mismatch fails with `VersionConflict` and writes nothing.
    async fn update(&self, saga: &SagaExecution, expected_version: Version)
    -> Result<SagaExecution>;

    /// Applies `mutation` to the current row while holding an exclusive
    /// lock on it, then writes the result with the next version.
    async fn update_exclusive(
        &self,
        saga_id: SagaId,
        mutation: SagaMutation,
    ) -> Result<SagaExecution>;

    /// All sagas not in a terminal state, oldest first.
    async fn find_active(&self) -> Result<Vec<SagaExecution>>;

    /// All sagas currently in `state`, oldest first.
    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>>;

    /// Active sagas for one `(customer, product)` key, oldest first.
    async fn find_active_for_key(
        &self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Vec<SagaExecution>>;

    /// Appends an audit event and returns its creation sequence.
    async fn append_event(&self, event: SagaEventRecord) -> Result<i64>;

    /// Audit events for one saga in creation order.
    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEventRecord>>;

    /// Number of sagas per state. States with no sagas are omitted.
    async fn state_counts(&self) -> Result<BTreeMap<SagaState, u64>>;
}

/// Extension trait providing convenience methods for saga repositories.
#[async_trait]
pub trait SagaRepositoryExt: SagaRepository {
    /// Loads a saga, failing with `SagaNotFound` if it does not exist.
    async fn get_required(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.get(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))
    }

    /// Counts sagas that have not reached a terminal state.
    async fn active_count(&self) -> Result<u64> {
        let counts = self.state_counts().await?;
        Ok(counts
            .iter()
            .filter(|(state, _)| state.is_active())
            .map(|(_, count)| count)
            .sum())
    }
}

impl<T: SagaRepository + ?Sized> SagaRepositoryExt for T {}

/// Checks that `proposed` may replace `stored`.
///
/// The stored row must not be terminal and the state change must either
/// keep the state or follow the transition table.
pub fn validate_write(stored: &SagaExecution, proposed: &SagaExecution) -> Result<()> {
    if stored.is_terminal() {
        return Err(StoreError::TerminalSaga {
            saga_id: stored.saga_id(),
            state: stored.current_state(),
        });
    }
    let from = stored.current_state();
    let to = proposed.current_state();
    if from != to && !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition { from, to });
    }
    Ok(())
}

/// States from which a write may land in `to`.
pub(crate) fn predecessor_states(to: SagaState) -> Vec<SagaState> {
    SagaState::ALL
        .into_iter()
        .filter(|from| from.is_active() && (*from == to || from.can_transition_to(to)))
        .collect()
}
