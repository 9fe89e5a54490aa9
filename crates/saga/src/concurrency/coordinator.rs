//! Race prevention for saga writes and stock reservation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use common::{ProductId, SagaId};
use saga_store::{SagaExecution, SagaRepository, SagaRepositoryExt, StoreError};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::LockTable;
use crate::config::{ConcurrencyConfig, OptimisticRetryConfig};
use crate::error::{Result, SagaError};

/// Lock table occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStats {
    pub active_key_locks: usize,
    pub active_product_locks: usize,
}

/// Active sagas grouped by `customerId:productId`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConcurrencyReport {
    pub active_by_key: BTreeMap<String, usize>,
    /// Keys with more than one active saga.
    pub potential_races: Vec<String>,
}

/// Serializes conflicting work on saga rows and on stock.
///
/// Ordinary state writes use [`update_with_retry`](Self::update_with_retry),
/// a bounded compare-and-swap loop. Stock reservation additionally runs
/// under a per-key mutex with first-come-first-served arbitration and under
/// the product's write lock, while verification only takes the product's
/// read lock.
pub struct ConcurrencyCoordinator<R> {
    repo: Arc<R>,
    config: ConcurrencyConfig,
    retry: OptimisticRetryConfig,
    key_locks: LockTable<Mutex<()>>,
    product_locks: LockTable<RwLock<()>>,
}

impl<R: SagaRepository> ConcurrencyCoordinator<R> {
    pub fn new(repo: Arc<R>, config: ConcurrencyConfig, retry: OptimisticRetryConfig) -> Self {
        Self {
            repo,
            config,
            retry,
            key_locks: LockTable::new(),
            product_locks: LockTable::new(),
        }
    }

    pub fn retry_config(&self) -> &OptimisticRetryConfig {
        &self.retry
    }

    /// Reads the saga, applies `mutate` to a copy and writes it back with a
    /// version check, retrying on conflict with exponential backoff.
    ///
    /// `updated_at` is stamped on every attempt. Fails with
    /// `OptimisticLockConflict` once the attempts are used up.
    pub async fn update_with_retry<F>(&self, saga_id: SagaId, mutate: F) -> Result<SagaExecution>
    where
        F: Fn(&mut SagaExecution) -> saga_store::Result<()> + Send + Sync,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let current = self.repo.get_required(saga_id).await?;
            let mut next = current.clone();
            mutate(&mut next)?;
            next.touch(Utc::now());

            match self.repo.update(&next, current.version()).await {
                Ok(written) => return Ok(written),
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) => {
                    metrics::counter!("saga_lock_conflicts_total", "kind" => "optimistic")
                        .increment(1);
                    tracing::warn!(%saga_id, attempt, %expected, %actual, "optimistic lock conflict");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(%saga_id, attempts = max_attempts, "optimistic lock retries exhausted");
        Err(SagaError::OptimisticLockConflict {
            saga_id,
            attempts: max_attempts,
        })
    }

    /// Applies `mutate` while the row is exclusively locked by the store.
    ///
    /// A serialization failure is retried like an optimistic conflict.
    pub async fn update_exclusive<F>(&self, saga_id: SagaId, mutate: F) -> Result<SagaExecution>
    where
        F: Fn(&mut SagaExecution) -> saga_store::Result<()> + Send + Sync + 'static,
    {
        let mutate = Arc::new(mutate);
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mutate = mutate.clone();
            let result = self
                .repo
                .update_exclusive(
                    saga_id,
                    Box::new(move |saga: &mut SagaExecution| -> saga_store::Result<()> {
                        (*mutate)(saga)?;
                        saga.touch(Utc::now());
                        Ok(())
                    }),
                )
                .await;

            match result {
                Ok(written) => return Ok(written),
                Err(StoreError::VersionConflict { .. }) => {
                    metrics::counter!("saga_lock_conflicts_total", "kind" => "serialization")
                        .increment(1);
                    tracing::warn!(%saga_id, attempt, "serialization conflict on exclusive update");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SagaError::OptimisticLockConflict {
            saga_id,
            attempts: max_attempts,
        })
    }

    /// Runs a stock verification under the product's shared lock.
    pub async fn verify_shared<T, F, Fut>(&self, product_id: &ProductId, verify: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.product_locks.lease(product_id.as_str());
        let _read = lease.read().await;
        verify().await
    }

    /// Runs a stock reservation with exclusive access to the saga's
    /// `customerId:productId` key and to the product.
    ///
    /// Fails without calling `reserve` when too many sagas are active for
    /// the key, or when an earlier-created saga for the key is still
    /// verifying or reserving. Every lock is released before returning.
    pub async fn reserve_exclusive<T, F, Fut>(&self, saga: &SagaExecution, reserve: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = saga.lock_key();

        let active = self
            .repo
            .find_active_for_key(saga.customer_id(), saga.product_id())
            .await?;
        if active.len() > self.config.max_concurrent_per_key {
            metrics::counter!("saga_lock_conflicts_total", "kind" => "limit").increment(1);
            tracing::warn!(
                saga_id = %saga.saga_id(),
                %key,
                active = active.len(),
                limit = self.config.max_concurrent_per_key,
                "concurrent saga limit exceeded"
            );
            return Err(SagaError::ConcurrentSagaLimitExceeded {
                key,
                active: active.len(),
                limit: self.config.max_concurrent_per_key,
            });
        }

        let key_lease = self.key_locks.lease(&key);
        let _key_guard = key_lease.lock().await;

        // Re-read under the key lock so the arbitration sees every saga
        // that got here first.
        let contenders = self
            .repo
            .find_active_for_key(saga.customer_id(), saga.product_id())
            .await?;
        let mine = (saga.created_at(), saga.saga_id());
        if let Some(earlier) = contenders.iter().find(|other| {
            other.saga_id() != saga.saga_id()
                && other.current_state().is_contending_for_stock()
                && (other.created_at(), other.saga_id()) < mine
        }) {
            metrics::counter!("saga_lock_conflicts_total", "kind" => "race").increment(1);
            tracing::info!(
                saga_id = %saga.saga_id(),
                blocking = %earlier.saga_id(),
                %key,
                "yielding to earlier saga"
            );
            return Err(SagaError::RaceConditionBlocked {
                saga_id: saga.saga_id(),
                blocking: earlier.saga_id(),
                key,
            });
        }

        let product_lease = self.product_locks.lease(saga.product_id().as_str());
        let _write = product_lease.write().await;
        tracing::debug!(saga_id = %saga.saga_id(), %key, "reservation lock acquired");

        Ok(reserve().await)
    }

    pub fn statistics(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            active_key_locks: self.key_locks.len(),
            active_product_locks: self.product_locks.len(),
        }
    }

    /// Groups active sagas by key and flags keys with more than one.
    pub async fn concurrency_report(&self) -> Result<ConcurrencyReport> {
        let mut report = ConcurrencyReport::default();
        for saga in self.repo.find_active().await? {
            *report.active_by_key.entry(saga.lock_key()).or_insert(0) += 1;
        }
        report.potential_races = report
            .active_by_key
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(key, _)| key.clone())
            .collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use common::{CustomerId, Money};
    use saga_store::{InMemorySagaStore, SagaState};

    use super::*;

    fn coordinator(store: &InMemorySagaStore) -> ConcurrencyCoordinator<InMemorySagaStore> {
        ConcurrencyCoordinator::new(
            Arc::new(store.clone()),
            ConcurrencyConfig::default(),
            OptimisticRetryConfig {
                base_backoff: Duration::from_millis(1),
                ..OptimisticRetryConfig::default()
            },
        )
    }

    async fn insert_saga(
        store: &InMemorySagaStore,
        age_ms: i64,
        states: &[SagaState],
    ) -> SagaExecution {
        let saga = SagaExecution::new(
            SagaId::new(),
            CustomerId::new("42"),
            ProductId::new("7"),
            1,
            Money::from_cents(500),
            "CREDIT_CARD",
            Utc::now() - ChronoDuration::milliseconds(age_ms),
        );
        store.insert(&saga).await.unwrap();
        let mut current = saga;
        for state in states {
            let expected = current.version();
            current.transition_to(*state).unwrap();
            current = store.update(&current, expected).await.unwrap();
        }
        current
    }

    #[tokio::test]
    async fn test_update_with_retry_recovers_from_conflicts() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let saga = insert_saga(&store, 0, &[]).await;
        store.inject_conflicts(2);

        let written = coordinator
            .update_with_retry(saga.saga_id(), |s| s.transition_to(SagaState::StockVerifying))
            .await
            .unwrap();

        assert_eq!(written.current_state(), SagaState::StockVerifying);
        assert!(written.updated_at() >= saga.updated_at());
    }

    #[tokio::test]
    async fn test_update_with_retry_gives_up() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let saga = insert_saga(&store, 0, &[]).await;
        store.inject_conflicts(3);

        let result = coordinator
            .update_with_retry(saga.saga_id(), |s| s.transition_to(SagaState::StockVerifying))
            .await;

        assert!(matches!(
            result,
            Err(SagaError::OptimisticLockConflict { attempts: 3, .. })
        ));
        let stored = store.get_required(saga.saga_id()).await.unwrap();
        assert_eq!(stored.current_state(), SagaState::SaleInitiated);
    }

    #[tokio::test]
    async fn test_update_with_retry_does_not_retry_invalid_transition() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let saga = insert_saga(&store, 0, &[]).await;

        let result = coordinator
            .update_with_retry(saga.saga_id(), |s| s.transition_to(SagaState::OrderConfirming))
            .await;
        assert!(matches!(result, Err(SagaError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_later_saga_yields_to_earlier_contender() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let earlier = insert_saga(&store, 10, &[SagaState::StockVerifying]).await;
        let later = insert_saga(
            &store,
            0,
            &[SagaState::StockVerifying, SagaState::StockReserving],
        )
        .await;

        let calls = AtomicU32::new(0);
        let result = coordinator
            .reserve_exclusive(&later, || async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(
            result,
            Err(SagaError::RaceConditionBlocked { blocking, .. }) if blocking == earlier.saga_id()
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.statistics().active_key_locks, 0);
    }

    #[tokio::test]
    async fn test_earlier_saga_proceeds() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let earlier = insert_saga(
            &store,
            10,
            &[SagaState::StockVerifying, SagaState::StockReserving],
        )
        .await;
        insert_saga(&store, 0, &[SagaState::StockVerifying]).await;

        let result = coordinator.reserve_exclusive(&earlier, || async { "RES-1" }).await;
        assert_eq!(result.unwrap(), "RES-1");
    }

    #[tokio::test]
    async fn test_sagas_past_reservation_do_not_block() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        insert_saga(
            &store,
            10,
            &[
                SagaState::StockVerifying,
                SagaState::StockReserving,
                SagaState::PaymentProcessing,
            ],
        )
        .await;
        let later = insert_saga(
            &store,
            0,
            &[SagaState::StockVerifying, SagaState::StockReserving],
        )
        .await;

        assert!(coordinator.reserve_exclusive(&later, || async {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_saga_limit() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        for _ in 0..3 {
            insert_saga(&store, 0, &[SagaState::StockVerifying, SagaState::StockReserving, SagaState::PaymentProcessing]).await;
        }
        let newest = insert_saga(&store, 0, &[SagaState::StockVerifying, SagaState::StockReserving]).await;

        let result = coordinator.reserve_exclusive(&newest, || async {}).await;
        assert!(matches!(
            result,
            Err(SagaError::ConcurrentSagaLimitExceeded { active: 4, limit: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrency_report() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        insert_saga(&store, 5, &[]).await;
        insert_saga(&store, 0, &[]).await;

        let report = coordinator.concurrency_report().await.unwrap();
        assert_eq!(report.active_by_key.get("42:7"), Some(&2));
        assert_eq!(report.potential_races, vec!["42:7".to_string()]);
    }

    #[tokio::test]
    async fn test_update_exclusive_stamps_updated_at() {
        let store = InMemorySagaStore::new();
        let coordinator = coordinator(&store);
        let saga = insert_saga(&store, 1_000, &[]).await;

        let written = coordinator
            .update_exclusive(saga.saga_id(), |s| s.record_stock_reservation("RES-1"))
            .await
            .unwrap();
        assert_eq!(written.stock_reservation_id(), Some("RES-1"));
        assert!(written.updated_at() > saga.created_at());
    }
}
