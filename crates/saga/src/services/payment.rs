//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{CustomerId, Money, ProductId, SagaId};

use super::{Behavior, InjectedFailure, simulate_latency};
use crate::error::ServiceError;

const SERVICE: &str = "transaction-service";

#[derive(Debug, Clone)]
pub struct ProcessPaymentRequest {
    pub customer_id: CustomerId,
    pub amount: Money,
    pub payment_method: String,
    pub saga_id: SagaId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges the customer and returns the transaction ID.
    async fn process_payment(&self, request: &ProcessPaymentRequest)
    -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    transactions: HashMap<String, (SagaId, CustomerId, Money)>,
    by_saga: HashMap<SagaId, String>,
    next_id: u32,
    calls: u32,
    behavior: Behavior,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&InMemoryPaymentState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_failure(&self, failure: Option<InjectedFailure>) {
        self.write().behavior.set_failure(failure);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.write().behavior.set_latency(latency);
    }

    pub fn calls(&self) -> u32 {
        self.read(|s| s.calls)
    }

    /// Returns the number of captured payments.
    pub fn transaction_count(&self) -> usize {
        self.read(|s| s.transactions.len())
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_transaction(&self, transaction_id: &str) -> bool {
        self.read(|s| s.transactions.contains_key(transaction_id))
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn process_payment(
        &self,
        request: &ProcessPaymentRequest,
    ) -> Result<String, ServiceError> {
        let latency = {
            let mut state = self.write();
            state.calls += 1;
            state.behavior.latency()
        };
        simulate_latency(latency).await;

        let mut state = self.write();
        if let Some(error) = state.behavior.take_failure(SERVICE) {
            return Err(error);
        }
        if !request.amount.is_positive() {
            return Err(ServiceError::Rejected(format!(
                "Invalid payment amount {}",
                request.amount
            )));
        }
        if let Some(existing) = state.by_saga.get(&request.saga_id) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let transaction_id = format!("TXN-{:04}", state.next_id);
        state.transactions.insert(
            transaction_id.clone(),
            (request.saga_id, request.customer_id.clone(), request.amount),
        );
        state.by_saga.insert(request.saga_id, transaction_id.clone());

        Ok(transaction_id)
    }
}
