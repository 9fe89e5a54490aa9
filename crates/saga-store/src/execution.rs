use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CustomerId, Money, ProductId, Result, SagaId, SagaState, StoreError};

/// Default payment method when the caller does not name one.
pub const DEFAULT_PAYMENT_METHOD: &str = "CREDIT_CARD";

/// Row version used for compare-and-swap writes.
///
/// A freshly inserted saga is at version 0; every successful update
/// increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a newly inserted row.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One sale transaction attempt.
///
/// Fields are only changed through the mutators below, which consult the
/// state machine and refuse to touch a terminal saga. The repository
/// decides whether the mutated copy may be written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub(crate) saga_id: SagaId,
    pub(crate) current_state: SagaState,
    pub(crate) customer_id: CustomerId,
    pub(crate) product_id: ProductId,
    pub(crate) quantity: u32,
    pub(crate) amount: Money,
    pub(crate) payment_method: String,
    pub(crate) stock_reservation_id: Option<String>,
    pub(crate) payment_transaction_id: Option<String>,
    pub(crate) order_id: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: Version,
}

impl SagaExecution {
    /// Creates a saga in `SaleInitiated` at version 0.
    pub fn new(
        saga_id: SagaId,
        customer_id: CustomerId,
        product_id: ProductId,
        quantity: u32,
        amount: Money,
        payment_method: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            current_state: SagaState::SaleInitiated,
            customer_id,
            product_id,
            quantity,
            amount,
            payment_method: payment_method.into(),
            stock_reservation_id: None,
            payment_transaction_id: None,
            order_id: None,
            error_message: None,
            created_at: at,
            updated_at: at,
            version: Version::initial(),
        }
    }

    /// Rebuilds a saga from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        saga_id: SagaId,
        current_state: SagaState,
        customer_id: CustomerId,
        product_id: ProductId,
        quantity: u32,
        amount: Money,
        payment_method: String,
        stock_reservation_id: Option<String>,
        payment_transaction_id: Option<String>,
        order_id: Option<String>,
        error_message: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: Version,
    ) -> Self {
        Self {
            saga_id,
            current_state,
            customer_id,
            product_id,
            quantity,
            amount,
            payment_method,
            stock_reservation_id,
            payment_transaction_id,
            order_id,
            error_message,
            created_at,
            updated_at,
            version,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn current_state(&self) -> SagaState {
        self.current_state
    }

    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn payment_method(&self) -> &str {
        &self.payment_method
    }

    pub fn stock_reservation_id(&self) -> Option<&str> {
        self.stock_reservation_id.as_deref()
    }

    pub fn payment_transaction_id(&self) -> Option<&str> {
        self.payment_transaction_id.as_deref()
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// The `customerId:productId` key used for locking and arbitration.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.customer_id, self.product_id)
    }

    /// Moves to `next` if the transition table allows it.
    pub fn transition_to(&mut self, next: SagaState) -> Result<()> {
        self.ensure_mutable()?;
        if !self.current_state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.current_state,
                to: next,
            });
        }
        self.current_state = next;
        Ok(())
    }

    pub fn record_stock_reservation(&mut self, reservation_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.stock_reservation_id = Some(reservation_id.into());
        Ok(())
    }

    pub fn record_payment_transaction(&mut self, transaction_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.payment_transaction_id = Some(transaction_id.into());
        Ok(())
    }

    pub fn record_order(&mut self, order_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.order_id = Some(order_id.into());
        Ok(())
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Stamps `updated_at`. Callers do this on every write so the
    /// sweeper measures time since the last progress.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.current_state.is_terminal() {
            return Err(StoreError::TerminalSaga {
                saga_id: self.saga_id,
                state: self.current_state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saga() -> SagaExecution {
        SagaExecution::new(
            SagaId::new(),
            CustomerId::new("42"),
            ProductId::new("7"),
            2,
            Money::from_cents(1999),
            DEFAULT_PAYMENT_METHOD,
            Utc::now(),
        )
    }

    #[test]
    fn test_new_saga_defaults() {
        let saga = saga();
        assert_eq!(saga.current_state(), SagaState::SaleInitiated);
        assert_eq!(saga.version(), Version::initial());
        assert_eq!(saga.created_at(), saga.updated_at());
        assert!(saga.stock_reservation_id().is_none());
        assert!(saga.payment_transaction_id().is_none());
        assert!(saga.order_id().is_none());
        assert_eq!(saga.lock_key(), "42:7");
    }

    #[test]
    fn test_transition_follows_table() {
        let mut saga = saga();
        saga.transition_to(SagaState::StockVerifying).unwrap();

        let err = saga.transition_to(SagaState::PaymentProcessing).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: SagaState::StockVerifying,
                to: SagaState::PaymentProcessing
            }
        ));
        assert_eq!(saga.current_state(), SagaState::StockVerifying);
    }

    #[test]
    fn test_terminal_saga_is_immutable() {
        let mut saga = saga();
        saga.transition_to(SagaState::SaleFailed).unwrap();

        assert!(matches!(
            saga.set_error_message("late"),
            Err(StoreError::TerminalSaga { .. })
        ));
        assert!(matches!(
            saga.record_stock_reservation("R1"),
            Err(StoreError::TerminalSaga { .. })
        ));
        assert!(matches!(
            saga.transition_to(SagaState::SaleFailed),
            Err(StoreError::TerminalSaga { .. })
        ));
        assert!(saga.error_message().is_none());
    }

    #[test]
    fn test_version_next() {
        assert_eq!(Version::initial().next(), Version::new(1));
        assert_eq!(Version::new(41).next().as_i64(), 42);
    }
}
