//! Downstream capability traits and in-memory implementations.

pub mod gateway;
pub mod inventory;
pub mod order;
pub mod payment;

use std::time::Duration;

pub use gateway::{INVENTORY_SERVICE, ORDER_SERVICE, PAYMENT_SERVICE, ServiceGateway};
pub use inventory::{
    InMemoryInventoryService, InventoryService, ReleaseStockRequest, ReserveStockRequest,
    StockCheck, VerifyStockRequest,
};
pub use order::{CreateOrderRequest, InMemoryOrderService, OrderService};
pub use payment::{InMemoryPaymentService, PaymentService, ProcessPaymentRequest};

use crate::error::ServiceError;

/// Failure injected into an in-memory service operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Reject every call with this reason.
    Reject(String),
    /// Fail the next `n` calls as unavailable, then recover.
    Unavailable(u32),
    /// Fail every call as unavailable.
    Down,
}

/// Per-operation test behavior: added latency and an optional failure.
#[derive(Debug, Clone, Default)]
pub(crate) struct Behavior {
    latency: Duration,
    failure: Option<InjectedFailure>,
}

impl Behavior {
    pub(crate) fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    pub(crate) fn set_failure(&mut self, failure: Option<InjectedFailure>) {
        self.failure = failure;
    }

    pub(crate) fn latency(&self) -> Duration {
        self.latency
    }

    /// Consumes one injected failure, if any.
    pub(crate) fn take_failure(&mut self, service: &str) -> Option<ServiceError> {
        match self.failure.take()? {
            InjectedFailure::Reject(reason) => {
                self.failure = Some(InjectedFailure::Reject(reason.clone()));
                Some(ServiceError::Rejected(reason))
            }
            InjectedFailure::Unavailable(remaining) => {
                if remaining > 1 {
                    self.failure = Some(InjectedFailure::Unavailable(remaining - 1));
                }
                if remaining == 0 {
                    return None;
                }
                Some(ServiceError::Unavailable(format!("{service} is not responding")))
            }
            InjectedFailure::Down => {
                self.failure = Some(InjectedFailure::Down);
                Some(ServiceError::Unavailable(format!("{service} is down")))
            }
        }
    }
}

/// Sleeps for `latency` if non-zero.
pub(crate) async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}
