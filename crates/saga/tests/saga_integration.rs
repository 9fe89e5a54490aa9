//! Integration tests for the sale saga.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{CustomerId, Money, ProductId, SagaId};
use saga::{
    CircuitState, InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService,
    InjectedFailure, InventoryService, ResilienceConfig, RetryPolicy, SagaConfig, SagaEngine,
    SagaOutcome, ServicesConfig, SaleRequest,
};
use saga::services::ReserveStockRequest;
use saga_store::{
    InMemorySagaStore, SagaEventRecord, SagaEventType, SagaExecution, SagaMutation, SagaRepository,
    SagaRepositoryExt, SagaState, Version,
};

/// Something another actor does to the store at a chosen moment.
enum Interleaving {
    Write(SagaMutation),
    Conflicts(u32),
}

/// In-memory store that runs a pending [`Interleaving`] just before a chosen
/// audit event is appended, so a concurrent write can land in the middle of
/// another actor's read-modify-write.
#[derive(Clone, Default)]
struct InterleavedStore {
    inner: InMemorySagaStore,
    pending: Arc<Mutex<Option<(SagaEventType, Interleaving)>>>,
}

impl InterleavedStore {
    fn write_before(&self, trigger: SagaEventType, mutation: SagaMutation) {
        *self.pending.lock().unwrap() = Some((trigger, Interleaving::Write(mutation)));
    }

    fn conflicts_before(&self, trigger: SagaEventType, count: u32) {
        *self.pending.lock().unwrap() = Some((trigger, Interleaving::Conflicts(count)));
    }
}

#[async_trait]
impl SagaRepository for InterleavedStore {
    async fn insert(&self, saga: &SagaExecution) -> saga_store::Result<()> {
        self.inner.insert(saga).await
    }

    async fn get(&self, saga_id: SagaId) -> saga_store::Result<Option<SagaExecution>> {
        self.inner.get(saga_id).await
    }

    async fn update(
        &self,
        saga: &SagaExecution,
        expected_version: Version,
    ) -> saga_store::Result<SagaExecution> {
        self.inner.update(saga, expected_version).await
    }

    async fn update_exclusive(
        &self,
        saga_id: SagaId,
        mutation: SagaMutation,
    ) -> saga_store::Result<SagaExecution> {
        self.inner.update_exclusive(saga_id, mutation).await
    }

    async fn find_active(&self) -> saga_store::Result<Vec<SagaExecution>> {
        self.inner.find_active().await
    }

    async fn find_by_state(&self, state: SagaState) -> saga_store::Result<Vec<SagaExecution>> {
        self.inner.find_by_state(state).await
    }

    async fn find_active_for_key(
        &self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> saga_store::Result<Vec<SagaExecution>> {
        self.inner.find_active_for_key(customer_id, product_id).await
    }

    async fn append_event(&self, event: SagaEventRecord) -> saga_store::Result<i64> {
        let due = {
            let mut pending = self.pending.lock().unwrap();
            match pending.take() {
                Some((trigger, action)) if trigger == event.event_type => Some(action),
                other => {
                    *pending = other;
                    None
                }
            }
        };
        match due {
            Some(Interleaving::Write(mutation)) => {
                self.inner.update_exclusive(event.saga_id, mutation).await?;
            }
            Some(Interleaving::Conflicts(count)) => self.inner.inject_conflicts(count),
            None => {}
        }
        self.inner.append_event(event).await
    }

    async fn events_for_saga(&self, saga_id: SagaId) -> saga_store::Result<Vec<SagaEventRecord>> {
        self.inner.events_for_saga(saga_id).await
    }

    async fn state_counts(&self) -> saga_store::Result<BTreeMap<SagaState, u64>> {
        self.inner.state_counts().await
    }
}

struct TestHarness {
    engine: SagaEngine<InterleavedStore>,
    interleaved: InterleavedStore,
    store: InMemorySagaStore,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    order: InMemoryOrderService,
}

impl TestHarness {
    fn new() -> Self {
        let interleaved = InterleavedStore::default();
        let store = interleaved.inner.clone();
        let inventory = InMemoryInventoryService::new();
        let payment = InMemoryPaymentService::new();
        let order = InMemoryOrderService::new();
        inventory.set_stock("7", 10);

        let config = SagaConfig {
            services: ServicesConfig::uniform(ResilienceConfig {
                retry: RetryPolicy {
                    initial_backoff: Duration::from_millis(1),
                    ..RetryPolicy::default()
                },
                ..ResilienceConfig::default()
            }),
            ..SagaConfig::default()
        };
        let engine = SagaEngine::new(
            Arc::new(interleaved.clone()),
            Arc::new(inventory.clone()),
            Arc::new(payment.clone()),
            Arc::new(order.clone()),
            config,
        );

        Self {
            engine,
            interleaved,
            store,
            inventory,
            payment,
            order,
        }
    }

    async fn sell(&self, quantity: u32) -> SagaOutcome {
        self.engine
            .orchestrator()
            .execute_sale(SaleRequest::new(
                "42",
                "7",
                quantity,
                Money::from_cents(1999 * i64::from(quantity)),
            ))
            .await
    }

    async fn saga(&self, saga_id: SagaId) -> SagaExecution {
        self.store.get_required(saga_id).await.unwrap()
    }

    async fn event_types(&self, saga_id: SagaId) -> Vec<SagaEventType> {
        self.store
            .events_for_saga(saga_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// Reserves one unit for `saga` straight from the inventory service.
    async fn reserve_for(&self, saga: &SagaExecution) -> String {
        self.inventory
            .reserve_stock(&ReserveStockRequest {
                product_id: saga.product_id().clone(),
                quantity: saga.quantity(),
                saga_id: saga.saga_id(),
                customer_id: saga.customer_id().clone(),
            })
            .await
            .unwrap()
    }

    /// Inserts a saga for customer 42 / product 7 directly in `state`.
    async fn insert_in(&self, state: SagaState, updated_at: chrono::DateTime<Utc>) -> SagaExecution {
        let mut saga = SagaExecution::new(
            SagaId::new(),
            CustomerId::new("42"),
            ProductId::new("7"),
            1,
            Money::from_cents(1999),
            "CREDIT_CARD",
            updated_at,
        );
        self.store.insert(&saga).await.unwrap();
        let mut current = SagaState::SaleInitiated;
        while current != state {
            let next = current.next_on_happy_path().unwrap();
            let expected = saga.version();
            saga.transition_to(next).unwrap();
            saga.touch(updated_at);
            saga = self.store.update(&saga, expected).await.unwrap();
            current = next;
        }
        saga
    }
}

#[tokio::test]
async fn test_happy_path_confirms_sale() {
    let h = TestHarness::new();

    let outcome = h.sell(2).await;

    assert_eq!(outcome.state, SagaState::SaleConfirmed);
    assert!(outcome.is_confirmed());
    assert_eq!(outcome.message, "Sale completed successfully");

    let saga = h.saga(outcome.saga_id).await;
    assert_eq!(saga.current_state(), SagaState::SaleConfirmed);
    assert!(saga.stock_reservation_id().is_some());
    assert!(saga.payment_transaction_id().is_some());
    assert!(saga.order_id().is_some());
    assert!(saga.error_message().is_none());

    assert_eq!(h.inventory.stock(&ProductId::new("7")), 8);
    assert_eq!(h.payment.transaction_count(), 1);
    assert_eq!(h.order.order_count(), 1);
    assert!(h.inventory.released().is_empty());

    let events = h.event_types(outcome.saga_id).await;
    assert_eq!(events.first(), Some(&SagaEventType::SagaStarted));
    assert_eq!(events.last(), Some(&SagaEventType::SagaCompleted));
    let transitions = events
        .iter()
        .filter(|t| **t == SagaEventType::StateTransition)
        .count();
    assert_eq!(transitions, 5);
}

#[tokio::test]
async fn test_insufficient_stock_fails_without_reservation() {
    let h = TestHarness::new();
    h.inventory.set_stock("7", 0);

    let outcome = h.sell(1).await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert_eq!(
        outcome.message,
        "Insufficient stock available. Requested: 1, Available: 0"
    );
    assert_eq!(h.inventory.reserve_calls(), 0);
    assert_eq!(h.inventory.release_calls(), 0);
    assert_eq!(h.payment.calls(), 0);

    let saga = h.saga(outcome.saga_id).await;
    assert_eq!(saga.current_state(), SagaState::SaleFailed);
    assert!(saga.stock_reservation_id().is_none());
}

#[tokio::test]
async fn test_payment_failure_releases_reservation() {
    let h = TestHarness::new();
    h.payment
        .set_failure(Some(InjectedFailure::Reject("card declined".into())));

    let outcome = h.sell(1).await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert!(outcome.message.contains("card declined"));

    let saga = h.saga(outcome.saga_id).await;
    let reservation_id = saga.stock_reservation_id().unwrap().to_string();
    assert_eq!(h.inventory.released(), vec![reservation_id]);
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 10);
    assert!(saga.error_message().unwrap().contains("card declined"));
    assert_eq!(h.order.calls(), 0);

    let events = h.event_types(outcome.saga_id).await;
    assert!(events.contains(&SagaEventType::ServiceCallFailed));
    assert!(events.contains(&SagaEventType::CompensationCompleted));
    assert!(!events.contains(&SagaEventType::CircuitBreakerFallback));
}

#[tokio::test]
async fn test_compensation_is_idempotent() {
    let h = TestHarness::new();
    h.payment
        .set_failure(Some(InjectedFailure::Reject("card declined".into())));
    let outcome = h.sell(1).await;
    assert_eq!(h.inventory.release_calls(), 1);

    let report = h
        .engine
        .compensation()
        .compensate(outcome.saga_id, "again")
        .await
        .unwrap();

    assert!(report.already_terminal);
    assert_eq!(h.inventory.release_calls(), 1);
    let saga = h.saga(outcome.saga_id).await;
    assert!(saga.error_message().unwrap().contains("card declined"));
}

#[tokio::test]
async fn test_order_failure_flags_payment_reversal() {
    let h = TestHarness::new();
    h.order
        .set_failure(Some(InjectedFailure::Reject("store closed".into())));

    let outcome = h.sell(1).await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert_eq!(outcome.message, "Order creation failed: store closed");
    assert_eq!(h.payment.transaction_count(), 1);
    assert_eq!(h.inventory.released().len(), 1);

    let events = h.event_types(outcome.saga_id).await;
    assert!(events.contains(&SagaEventType::PaymentReversalRequired));
}

#[tokio::test]
async fn test_later_saga_yields_to_earlier_contender() {
    let h = TestHarness::new();
    let earlier = h.insert_in(SagaState::StockVerifying, Utc::now()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = h.sell(1).await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert!(outcome.message.contains("in progress"));
    assert_eq!(h.inventory.reserve_calls(), 0);
    assert_eq!(
        h.saga(earlier.saga_id()).await.current_state(),
        SagaState::StockVerifying
    );
}

#[tokio::test]
async fn test_racing_sagas_reserve_one_at_a_time() {
    let h = Arc::new(TestHarness::new());
    h.inventory.set_reserve_latency(Duration::from_millis(50));

    let first = {
        let h = h.clone();
        tokio::spawn(async move { h.sell(1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let h = h.clone();
        tokio::spawn(async move { h.sell(1).await })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(first.state, SagaState::SaleConfirmed);
    assert_eq!(h.inventory.max_reserve_in_flight(), 1);
    assert_eq!(h.inventory.reserve_order().first(), Some(&first.saga_id));
    if second.state == SagaState::SaleFailed {
        // The later saga may only lose arbitration; it never reserved.
        assert!(h.saga(second.saga_id).await.stock_reservation_id().is_none());
    } else {
        assert_eq!(h.inventory.reserve_order().get(1), Some(&second.saga_id));
    }
}

#[tokio::test]
async fn test_concurrent_saga_limit_is_backpressure() {
    let h = TestHarness::new();
    for _ in 0..3 {
        h.insert_in(SagaState::SaleInitiated, Utc::now()).await;
    }

    let outcome = h.sell(1).await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert!(outcome.message.contains("Too many sales"));
    assert_eq!(h.inventory.reserve_calls(), 0);
}

#[tokio::test]
async fn test_sweeper_fails_stalled_reservation() {
    let h = TestHarness::new();
    let stalled = h
        .insert_in(
            SagaState::StockReserving,
            Utc::now() - ChronoDuration::seconds(31),
        )
        .await;

    let report = h.engine.sweeper().sweep().await.unwrap();

    assert_eq!(report.timed_out.len(), 1);
    let saga = h.saga(stalled.saga_id()).await;
    assert_eq!(saga.current_state(), SagaState::SaleFailed);
    assert!(saga.error_message().unwrap().starts_with("TIMEOUT:"));
    assert_eq!(h.inventory.verify_calls(), 0);
    assert_eq!(h.inventory.reserve_calls(), 0);
    assert_eq!(h.inventory.release_calls(), 0);

    let events = h.event_types(stalled.saga_id()).await;
    assert!(events.contains(&SagaEventType::Timeout));
    assert!(events.contains(&SagaEventType::SagaFailed));
}

#[tokio::test]
async fn test_reservation_on_finalized_saga_is_released() {
    let h = TestHarness::new();
    h.inventory.set_reserve_latency(Duration::from_millis(200));

    let sale = {
        let orchestrator = h.engine.orchestrator().clone();
        tokio::spawn(async move {
            orchestrator
                .execute_sale(SaleRequest::new("42", "7", 1, Money::from_cents(1999)))
                .await
        })
    };

    let saga_id = loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reserving = h.store.find_by_state(SagaState::StockReserving).await.unwrap();
        if let Some(saga) = reserving.first() {
            break saga.saga_id();
        }
    };
    h.engine
        .compensation()
        .compensate(saga_id, "cancelled by operator")
        .await
        .unwrap();

    let outcome = sale.await.unwrap();

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert_eq!(outcome.message, "cancelled by operator");
    assert_eq!(h.inventory.reservation_count(), 0);
    assert_eq!(h.inventory.released().len(), 1);
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 10);
    assert_eq!(h.payment.calls(), 0);
}

#[tokio::test]
async fn test_sweeper_releases_reservation_recorded_during_compensation() {
    let h = TestHarness::new();
    let stalled = h
        .insert_in(
            SagaState::StockReserving,
            Utc::now() - ChronoDuration::seconds(31),
        )
        .await;
    let reservation_id = h.reserve_for(&stalled).await;
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 9);

    // The reserve step records its result right after the sweeper has read
    // the saga without one.
    let recorded = reservation_id.clone();
    h.interleaved.write_before(
        SagaEventType::CompensationStarted,
        Box::new(move |s: &mut SagaExecution| s.record_stock_reservation(recorded)),
    );

    let report = h.engine.sweeper().sweep().await.unwrap();

    assert_eq!(report.timed_out.len(), 1);
    let saga = h.saga(stalled.saga_id()).await;
    assert_eq!(saga.current_state(), SagaState::SaleFailed);
    assert_eq!(saga.stock_reservation_id(), Some(reservation_id.as_str()));
    assert!(saga.error_message().unwrap().starts_with("TIMEOUT:"));
    assert_eq!(h.inventory.released(), vec![reservation_id]);
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 10);

    let events = h.event_types(stalled.saga_id()).await;
    assert!(events.contains(&SagaEventType::CompensationCompleted));
}

#[tokio::test]
async fn test_payment_recorded_during_compensation_is_flagged() {
    let h = TestHarness::new();
    let saga = h.insert_in(SagaState::PaymentProcessing, Utc::now()).await;
    let reservation_id = h.reserve_for(&saga).await;
    let recorded = reservation_id.clone();
    h.store
        .update_exclusive(
            saga.saga_id(),
            Box::new(move |s: &mut SagaExecution| s.record_stock_reservation(recorded)),
        )
        .await
        .unwrap();

    // The payment step records its transaction once the stock is already
    // released.
    h.interleaved.write_before(
        SagaEventType::CompensationCompleted,
        Box::new(|s: &mut SagaExecution| s.record_payment_transaction("TXN-LATE")),
    );

    let report = h
        .engine
        .compensation()
        .compensate(saga.saga_id(), "TIMEOUT: saga stalled in PAYMENT_PROCESSING")
        .await
        .unwrap();

    assert!(report.stock_released);
    assert!(report.payment_reversal_required);
    assert_eq!(report.final_state, SagaState::SaleFailed);
    assert_eq!(h.inventory.release_calls(), 1);
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 10);

    let stored = h.saga(saga.saga_id()).await;
    assert_eq!(stored.current_state(), SagaState::SaleFailed);
    assert_eq!(stored.payment_transaction_id(), Some("TXN-LATE"));
    assert!(
        h.event_types(saga.saga_id())
            .await
            .contains(&SagaEventType::PaymentReversalRequired)
    );
}

#[tokio::test]
async fn test_unfinished_compensation_is_reported_and_swept() {
    let h = TestHarness::new();
    // Every compensation write attempt conflicts.
    h.interleaved.conflicts_before(SagaEventType::Error, 3);

    let outcome = h.sell(11).await;

    assert_eq!(outcome.state, SagaState::StockVerifying);
    assert!(!outcome.is_confirmed());
    assert_eq!(
        outcome.message,
        "Insufficient stock available. Requested: 11, Available: 10 (compensation pending)"
    );
    assert_eq!(
        h.saga(outcome.saga_id).await.current_state(),
        SagaState::StockVerifying
    );

    let report = h
        .engine
        .sweeper()
        .sweep_at(Utc::now() + ChronoDuration::minutes(10))
        .await
        .unwrap();

    assert_eq!(report.timed_out.len(), 1);
    let saga = h.saga(outcome.saga_id).await;
    assert_eq!(saga.current_state(), SagaState::SaleFailed);
    assert!(saga.error_message().unwrap().starts_with("TIMEOUT:"));
}

#[tokio::test]
async fn test_unavailable_payment_falls_back_and_opens_breaker() {
    let h = TestHarness::new();
    h.payment.set_failure(Some(InjectedFailure::Down));

    let first = h.sell(1).await;
    assert_eq!(first.state, SagaState::SaleFailed);
    assert!(first.message.starts_with("Payment processing failed"));
    let events = h.event_types(first.saga_id).await;
    assert!(events.contains(&SagaEventType::Retry));
    assert!(events.contains(&SagaEventType::CircuitBreakerFallback));
    assert!(!events.contains(&SagaEventType::ServiceCallFailed));

    h.sell(1).await;
    let third = h.sell(1).await;
    assert_eq!(third.state, SagaState::SaleFailed);

    // Five failed attempts open the breaker; the third sale never calls out.
    assert_eq!(h.payment.calls(), 5);
    let breakers = h.engine.gateway().breaker_snapshots();
    let payment = breakers
        .iter()
        .find(|b| b.name == "transaction-service")
        .unwrap();
    assert_eq!(payment.state, CircuitState::Open);

    // Every failed sale still released its reservation.
    assert_eq!(h.inventory.released().len(), 3);
    assert_eq!(h.inventory.stock(&ProductId::new("7")), 10);
}

#[tokio::test]
async fn test_invalid_request_is_not_persisted() {
    let h = TestHarness::new();

    let outcome = h
        .engine
        .orchestrator()
        .execute_sale(SaleRequest::new("42", "7", 0, Money::from_cents(1999)))
        .await;

    assert_eq!(outcome.state, SagaState::SaleFailed);
    assert!(outcome.message.contains("quantity"));
    assert_eq!(h.store.saga_count().await, 0);
}

#[tokio::test]
async fn test_statistics_and_queries() {
    let h = TestHarness::new();
    let confirmed = h.sell(1).await;
    h.inventory.set_stock("7", 0);
    h.sell(1).await;

    let stats = h.engine.orchestrator().statistics().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.by_state.get("SALE_CONFIRMED"), Some(&1));
    assert_eq!(stats.by_state.get("SALE_FAILED"), Some(&1));

    let saga = h
        .engine
        .orchestrator()
        .get_saga(confirmed.saga_id)
        .await
        .unwrap();
    assert_eq!(saga.saga_id(), confirmed.saga_id);

    let events = h
        .engine
        .orchestrator()
        .saga_events(confirmed.saga_id)
        .await
        .unwrap();
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

    assert!(matches!(
        h.engine.orchestrator().get_saga(SagaId::new()).await,
        Err(saga::SagaError::SagaNotFound(_))
    ));
    assert_eq!(h.engine.coordinator().statistics().active_key_locks, 0);
}
