//! Binds each downstream capability to its own resilient client.

use std::sync::Arc;

use crate::config::{ResilienceConfig, ServicesConfig};
use crate::resilience::{CallFailure, CircuitBreakerSnapshot, ResilientClient};

use super::{
    CreateOrderRequest, InventoryService, OrderService, PaymentService, ProcessPaymentRequest,
    ReleaseStockRequest, ReserveStockRequest, StockCheck, VerifyStockRequest,
};

pub const INVENTORY_SERVICE: &str = "inventory-service";
pub const PAYMENT_SERVICE: &str = "transaction-service";
pub const ORDER_SERVICE: &str = "store-service";

fn client(service: &str, config: &ResilienceConfig) -> ResilientClient {
    ResilientClient::new(
        service,
        config.circuit_breaker.clone(),
        config.retry.clone(),
        config.call_timeout,
    )
}

/// Every outbound call the saga makes goes through here.
pub struct ServiceGateway {
    inventory: Arc<dyn InventoryService>,
    payment: Arc<dyn PaymentService>,
    order: Arc<dyn OrderService>,
    inventory_client: ResilientClient,
    payment_client: ResilientClient,
    order_client: ResilientClient,
}

impl ServiceGateway {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        payment: Arc<dyn PaymentService>,
        order: Arc<dyn OrderService>,
        config: &ServicesConfig,
    ) -> Self {
        Self {
            inventory,
            payment,
            order,
            inventory_client: client(INVENTORY_SERVICE, &config.inventory),
            payment_client: client(PAYMENT_SERVICE, &config.payment),
            order_client: client(ORDER_SERVICE, &config.order),
        }
    }

    pub async fn verify_stock(&self, request: &VerifyStockRequest) -> Result<StockCheck, CallFailure> {
        let inventory = &self.inventory;
        self.inventory_client
            .call("verifyStock", || inventory.verify_stock(request))
            .await
    }

    pub async fn reserve_stock(&self, request: &ReserveStockRequest) -> Result<String, CallFailure> {
        let inventory = &self.inventory;
        self.inventory_client
            .call("reserveStock", || inventory.reserve_stock(request))
            .await
    }

    pub async fn release_stock(&self, request: &ReleaseStockRequest) -> Result<(), CallFailure> {
        let inventory = &self.inventory;
        self.inventory_client
            .call("releaseStock", || inventory.release_stock(request))
            .await
    }

    pub async fn process_payment(
        &self,
        request: &ProcessPaymentRequest,
    ) -> Result<String, CallFailure> {
        let payment = &self.payment;
        self.payment_client
            .call("processPayment", || payment.process_payment(request))
            .await
    }

    pub async fn create_order(&self, request: &CreateOrderRequest) -> Result<String, CallFailure> {
        let order = &self.order;
        self.order_client
            .call("createOrder", || order.create_order(request))
            .await
    }

    /// Breaker state of every downstream service.
    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        vec![
            self.inventory_client.breaker_snapshot(),
            self.payment_client.breaker_snapshot(),
            self.order_client.breaker_snapshot(),
        ]
    }

    /// Closes every breaker.
    pub fn reset_breakers(&self) {
        self.inventory_client.breaker().reset();
        self.payment_client.breaker().reset();
        self.order_client.breaker().reset();
    }
}

impl std::fmt::Debug for ServiceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGateway")
            .field("inventory_client", &self.inventory_client)
            .field("payment_client", &self.payment_client)
            .field("order_client", &self.order_client)
            .finish_non_exhaustive()
    }
}
