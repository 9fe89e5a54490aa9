//! Order (store) service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{CustomerId, Money, ProductId, SagaId};

use super::{Behavior, InjectedFailure, simulate_latency};
use crate::error::ServiceError;

const SERVICE: &str = "store-service";

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub customer_id: CustomerId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub amount: Money,
    pub saga_id: SagaId,
    pub reservation_id: String,
    pub transaction_id: String,
}

/// Trait for recording confirmed sales.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Records the order and returns its ID.
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<String, CreateOrderRequest>,
    by_saga: HashMap<SagaId, String>,
    next_id: u32,
    calls: u32,
    behavior: Behavior,
}

/// In-memory order service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryOrderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&InMemoryOrderState) -> T) -> T {
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

    pub fn order_count(&self) -> usize {
        self.read(|s| s.orders.len())
    }

    /// Returns the reservation and transaction an order was created with.
    pub fn order_references(&self, order_id: &str) -> Option<(String, String)> {
        self.read(|s| {
            s.orders
                .get(order_id)
                .map(|o| (o.reservation_id.clone(), o.transaction_id.clone()))
        })
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<String, ServiceError> {
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
        if let Some(existing) = state.by_saga.get(&request.saga_id) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let order_id = format!("ORD-{:04}", state.next_id);
        state.orders.insert(order_id.clone(), request.clone());
        state.by_saga.insert(request.saga_id, order_id.clone());

        Ok(order_id)
    }
}
