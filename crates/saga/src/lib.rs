//! Orchestrated sale saga.
//!
//! A sale moves through four steps, each calling one downstream service:
//! 1. Verify stock
//! 2. Reserve stock
//! 3. Process payment
//! 4. Create the order
//!
//! If a step fails, the recorded work is compensated and the saga ends in
//! `SALE_FAILED`. A background sweeper fails sagas that stall in any state.

pub mod audit;
pub mod compensation;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod resilience;
pub mod services;
pub mod timeout;

pub use audit::AuditLog;
pub use compensation::{CompensationExecutor, CompensationReport};
pub use concurrency::{ConcurrencyCoordinator, ConcurrencyReport, ConcurrencyStats, LockTable};
pub use config::{
    ConcurrencyConfig, OptimisticRetryConfig, ResilienceConfig, SagaConfig, ServicesConfig,
    TimeoutConfig,
};
pub use engine::SagaEngine;
pub use error::{Result, SagaError, ServiceError};
pub use orchestrator::{SagaOrchestrator, SagaOutcome, SagaStatistics, SaleRequest};
pub use resilience::{
    CallFailure, CallFailureKind, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
    CircuitState, ResilientClient, RetryPolicy,
};
pub use services::{
    InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, InjectedFailure,
    InventoryService, OrderService, PaymentService, ServiceGateway,
};
pub use timeout::{ApproachingTimeout, StateBudget, SweepReport, SweeperHandle, TimeoutSweeper};
