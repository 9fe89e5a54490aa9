//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{CustomerId, ProductId, SagaId};
use serde::Serialize;

use super::{Behavior, InjectedFailure, simulate_latency};
use crate::error::ServiceError;

const SERVICE: &str = "inventory-service";

#[derive(Debug, Clone)]
pub struct VerifyStockRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    pub saga_id: SagaId,
}

#[derive(Debug, Clone)]
pub struct ReserveStockRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    pub saga_id: SagaId,
    pub customer_id: CustomerId,
}

#[derive(Debug, Clone)]
pub struct ReleaseStockRequest {
    pub reservation_id: String,
    pub reason: String,
    pub saga_id: SagaId,
}

/// Result of a stock verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockCheck {
    pub available: bool,
    pub available_quantity: u32,
}

/// Trait for inventory operations used by the sale saga.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Checks whether `quantity` units can be reserved. Read-only.
    async fn verify_stock(&self, request: &VerifyStockRequest) -> Result<StockCheck, ServiceError>;

    /// Reserves stock and returns the reservation ID.
    ///
    /// Calling it again for the same saga returns the existing reservation.
    async fn reserve_stock(&self, request: &ReserveStockRequest) -> Result<String, ServiceError>;

    /// Returns reserved stock. Releasing an unknown reservation succeeds.
    async fn release_stock(&self, request: &ReleaseStockRequest) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone)]
struct Reservation {
    product_id: ProductId,
    quantity: u32,
    saga_id: SagaId,
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<ProductId, u32>,
    reservations: HashMap<String, Reservation>,
    by_saga: HashMap<SagaId, String>,
    released: Vec<String>,
    reserve_order: Vec<SagaId>,
    next_id: u32,
    verify_calls: u32,
    reserve_calls: u32,
    release_calls: u32,
    reserve_in_flight: HashMap<ProductId, u32>,
    max_reserve_in_flight: u32,
    verify: Behavior,
    reserve: Behavior,
    release: Behavior,
}

/// In-memory inventory service for tests, benches and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service with no stock.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&InMemoryInventoryState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Sets the on-hand quantity of a product.
    pub fn set_stock(&self, product_id: impl Into<ProductId>, quantity: u32) {
        self.write().stock.insert(product_id.into(), quantity);
    }

    /// Returns the unreserved quantity of a product.
    pub fn stock(&self, product_id: &ProductId) -> u32 {
        self.read(|s| s.stock.get(product_id).copied().unwrap_or(0))
    }

    pub fn set_verify_failure(&self, failure: Option<InjectedFailure>) {
        self.write().verify.set_failure(failure);
    }

    pub fn set_reserve_failure(&self, failure: Option<InjectedFailure>) {
        self.write().reserve.set_failure(failure);
    }

    pub fn set_release_failure(&self, failure: Option<InjectedFailure>) {
        self.write().release.set_failure(failure);
    }

    pub fn set_verify_latency(&self, latency: Duration) {
        self.write().verify.set_latency(latency);
    }

    pub fn set_reserve_latency(&self, latency: Duration) {
        self.write().reserve.set_latency(latency);
    }

    pub fn verify_calls(&self) -> u32 {
        self.read(|s| s.verify_calls)
    }

    pub fn reserve_calls(&self) -> u32 {
        self.read(|s| s.reserve_calls)
    }

    pub fn release_calls(&self) -> u32 {
        self.read(|s| s.release_calls)
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.read(|s| s.reservations.len())
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read(|s| s.reservations.contains_key(reservation_id))
    }

    /// Reservation IDs released so far, in order.
    pub fn released(&self) -> Vec<String> {
        self.read(|s| s.released.clone())
    }

    /// Sagas in the order their reservations completed.
    pub fn reserve_order(&self) -> Vec<SagaId> {
        self.read(|s| s.reserve_order.clone())
    }

    /// Highest number of reservation calls seen in flight at once for a
    /// single product.
    pub fn max_reserve_in_flight(&self) -> u32 {
        self.read(|s| s.max_reserve_in_flight)
    }
}

/// Tracks one in-flight reservation call; decrements on drop so a call
/// abandoned by a timeout is still accounted for.
struct InFlight<'a> {
    service: &'a InMemoryInventoryService,
    product_id: ProductId,
}

impl<'a> InFlight<'a> {
    fn enter(service: &'a InMemoryInventoryService, product_id: &ProductId) -> Self {
        let mut state = service.write();
        let count = state.reserve_in_flight.entry(product_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        state.max_reserve_in_flight = state.max_reserve_in_flight.max(count);
        Self {
            service,
            product_id: product_id.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.service.write();
        if let Some(count) = state.reserve_in_flight.get_mut(&self.product_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn verify_stock(&self, request: &VerifyStockRequest) -> Result<StockCheck, ServiceError> {
        let latency = {
            let mut state = self.write();
            state.verify_calls += 1;
            state.verify.latency()
        };
        simulate_latency(latency).await;

        let mut state = self.write();
        if let Some(error) = state.verify.take_failure(SERVICE) {
            return Err(error);
        }
        let on_hand = state.stock.get(&request.product_id).copied().unwrap_or(0);
        Ok(StockCheck {
            available: on_hand >= request.quantity,
            available_quantity: on_hand,
        })
    }

    async fn reserve_stock(&self, request: &ReserveStockRequest) -> Result<String, ServiceError> {
        let _in_flight = InFlight::enter(self, &request.product_id);
        let latency = {
            let mut state = self.write();
            state.reserve_calls += 1;
            state.reserve.latency()
        };
        simulate_latency(latency).await;

        let mut state = self.write();
        if let Some(error) = state.reserve.take_failure(SERVICE) {
            return Err(error);
        }
        if let Some(existing) = state.by_saga.get(&request.saga_id) {
            return Ok(existing.clone());
        }

        let on_hand = state.stock.get(&request.product_id).copied().unwrap_or(0);
        if on_hand < request.quantity {
            return Err(ServiceError::Rejected(format!(
                "Insufficient stock for product {}: requested {}, available {}",
                request.product_id, request.quantity, on_hand
            )));
        }
        state
            .stock
            .insert(request.product_id.clone(), on_hand - request.quantity);

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            Reservation {
                product_id: request.product_id.clone(),
                quantity: request.quantity,
                saga_id: request.saga_id,
            },
        );
        state.by_saga.insert(request.saga_id, reservation_id.clone());
        state.reserve_order.push(request.saga_id);

        Ok(reservation_id)
    }

    async fn release_stock(&self, request: &ReleaseStockRequest) -> Result<(), ServiceError> {
        let mut state = self.write();
        state.release_calls += 1;
        if let Some(error) = state.release.take_failure(SERVICE) {
            return Err(error);
        }

        if let Some(reservation) = state.reservations.remove(&request.reservation_id) {
            *state.stock.entry(reservation.product_id).or_insert(0) += reservation.quantity;
            state.by_saga.remove(&reservation.saga_id);
            state.released.push(request.reservation_id.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve_request(saga_id: SagaId, quantity: u32) -> ReserveStockRequest {
        ReserveStockRequest {
            product_id: ProductId::new("7"),
            quantity,
            saga_id,
            customer_id: CustomerId::new("42"),
        }
    }

    #[tokio::test]
    async fn test_verify_reports_on_hand_quantity() {
        let service = InMemoryInventoryService::new();
        service.set_stock("7", 3);

        let check = service
            .verify_stock(&VerifyStockRequest {
                product_id: ProductId::new("7"),
                quantity: 5,
                saga_id: SagaId::new(),
            })
            .await
            .unwrap();

        assert_eq!(
            check,
            StockCheck {
                available: false,
                available_quantity: 3
            }
        );
        assert_eq!(service.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();
        service.set_stock("7", 5);
        let saga_id = SagaId::new();

        let reservation_id = service.reserve_stock(&reserve_request(saga_id, 2)).await.unwrap();
        assert_eq!(reservation_id, "RES-0001");
        assert_eq!(service.stock(&ProductId::new("7")), 3);
        assert!(service.has_reservation(&reservation_id));

        service
            .release_stock(&ReleaseStockRequest {
                reservation_id: reservation_id.clone(),
                reason: "payment failed".to_string(),
                saga_id,
            })
            .await
            .unwrap();
        assert_eq!(service.stock(&ProductId::new("7")), 5);
        assert_eq!(service.reservation_count(), 0);
        assert_eq!(service.released(), vec![reservation_id]);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_saga() {
        let service = InMemoryInventoryService::new();
        service.set_stock("7", 5);
        let saga_id = SagaId::new();

        let first = service.reserve_stock(&reserve_request(saga_id, 2)).await.unwrap();
        let second = service.reserve_stock(&reserve_request(saga_id, 2)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.stock(&ProductId::new("7")), 3);
        assert_eq!(service.reserve_calls(), 2);
    }

    #[tokio::test]
    async fn test_reserve_rejects_insufficient_stock() {
        let service = InMemoryInventoryService::new();
        service.set_stock("7", 1);

        let result = service.reserve_stock(&reserve_request(SagaId::new(), 2)).await;
        assert!(matches!(result, Err(ServiceError::Rejected(_))));
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_release_unknown_reservation_succeeds() {
        let service = InMemoryInventoryService::new();
        let result = service
            .release_stock(&ReleaseStockRequest {
                reservation_id: "RES-9999".to_string(),
                reason: "cleanup".to_string(),
                saga_id: SagaId::new(),
            })
            .await;
        assert!(result.is_ok());
        assert!(service.released().is_empty());
    }

    #[tokio::test]
    async fn test_injected_transient_failure() {
        let service = InMemoryInventoryService::new();
        service.set_stock("7", 5);
        service.set_reserve_failure(Some(InjectedFailure::Unavailable(1)));

        let saga_id = SagaId::new();
        let first = service.reserve_stock(&reserve_request(saga_id, 1)).await;
        assert!(matches!(first, Err(ServiceError::Unavailable(_))));
        assert!(service.reserve_stock(&reserve_request(saga_id, 1)).await.is_ok());
        assert_eq!(service.max_reserve_in_flight(), 1);
    }
}
