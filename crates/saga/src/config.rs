//! Engine configuration.
//!
//! Plain data with defaults; the binary overrides fields from the
//! environment.

use std::time::Duration;

use saga_store::SagaState;

pub use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Per-state time budgets checked by the timeout sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    /// Budget for states without a specific entry.
    pub default: Duration,
    pub stock_verification: Duration,
    pub stock_reservation: Duration,
    pub payment_processing: Duration,
    pub order_confirmation: Duration,
    pub sweep_interval: Duration,
    /// Fraction of the budget after which a saga is reported as
    /// approaching its timeout.
    pub warning_ratio: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(300),
            stock_verification: Duration::from_secs(30),
            stock_reservation: Duration::from_secs(30),
            payment_processing: Duration::from_secs(60),
            order_confirmation: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            warning_ratio: 0.8,
        }
    }
}

impl TimeoutConfig {
    /// Time a saga may spend in `state` without a write.
    pub fn budget_for(&self, state: SagaState) -> Duration {
        match state {
            SagaState::StockVerifying => self.stock_verification,
            SagaState::StockReserving => self.stock_reservation,
            SagaState::PaymentProcessing => self.payment_processing,
            SagaState::OrderConfirming => self.order_confirmation,
            _ => self.default,
        }
    }
}

/// Retry loop around version-checked saga writes.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticRetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub multiplier: u32,
}

impl Default for OptimisticRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            multiplier: 2,
        }
    }
}

impl OptimisticRetryConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor)
    }
}

/// Call protection for one downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl ResilienceConfig {
    /// Upper bound on one protected call: every attempt running into the
    /// call timeout, with the longest backoff between attempts.
    pub fn worst_case_call(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        self.call_timeout
            .saturating_mul(attempts)
            .saturating_add(self.retry.max_backoff.saturating_mul(attempts - 1))
    }
}

/// Resilience settings per downstream service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicesConfig {
    pub inventory: ResilienceConfig,
    pub payment: ResilienceConfig,
    pub order: ResilienceConfig,
}

impl ServicesConfig {
    /// Applies the same settings to every service.
    pub fn uniform(config: ResilienceConfig) -> Self {
        Self {
            inventory: config.clone(),
            payment: config.clone(),
            order: config,
        }
    }

    /// The slowest [`ResilienceConfig::worst_case_call`] across services.
    pub fn worst_case_call(&self) -> Duration {
        [&self.inventory, &self.payment, &self.order]
            .into_iter()
            .map(ResilienceConfig::worst_case_call)
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    /// Active sagas allowed per `customerId:productId` key.
    pub max_concurrent_per_key: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_key: 3,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaConfig {
    pub timeouts: TimeoutConfig,
    pub optimistic_retry: OptimisticRetryConfig,
    pub services: ServicesConfig,
    pub concurrency: ConcurrencyConfig,
}

impl SagaConfig {
    /// Raises every state budget below the worst-case duration of one
    /// protected call to that duration, so retries alone never time a saga
    /// out. Returns the names of the budgets that were raised.
    pub fn enforce_step_budgets(&mut self) -> Vec<&'static str> {
        let floor = self.services.worst_case_call();
        let timeouts = &mut self.timeouts;
        let mut raised = Vec::new();
        for (name, budget) in [
            ("default", &mut timeouts.default),
            ("stock_verification", &mut timeouts.stock_verification),
            ("stock_reservation", &mut timeouts.stock_reservation),
            ("payment_processing", &mut timeouts.payment_processing),
            ("order_confirmation", &mut timeouts.order_confirmation),
        ] {
            if *budget < floor {
                *budget = floor;
                raised.push(name);
            }
        }
        raised
    }
}
