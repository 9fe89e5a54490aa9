//! Sale saga state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The state of a sale saga in its lifecycle.
///
/// State transitions:
/// ```text
/// SaleInitiated ──► StockVerifying ──► StockReserving ──► PaymentProcessing ──► OrderConfirming ──► SaleConfirmed
///        │                 │                 │                    │                   │
///        └─────────────────┴─────────────────┴──────┬─────────────┴───────────────────┘
///                                                   ▼
///                                 StockReleasing ──► SaleFailed
/// ```
///
/// Every non-terminal state may also move straight to `SaleFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    SaleInitiated,
    StockVerifying,
    StockReserving,
    PaymentProcessing,
    OrderConfirming,
    /// Compensation in progress: a reservation is being released.
    StockReleasing,
    /// Terminal success.
    SaleConfirmed,
    /// Terminal failure.
    SaleFailed,
}

use SagaState::*;

/// Legal next states, indexed by the current state. This table is the only
/// place transitions are defined; every mutation consults it.
const TRANSITIONS: &[(SagaState, &[SagaState])] = &[
    (SaleInitiated, &[StockVerifying, StockReleasing, SaleFailed]),
    (StockVerifying, &[StockReserving, StockReleasing, SaleFailed]),
    (StockReserving, &[PaymentProcessing, StockReleasing, SaleFailed]),
    (PaymentProcessing, &[OrderConfirming, StockReleasing, SaleFailed]),
    (OrderConfirming, &[SaleConfirmed, StockReleasing, SaleFailed]),
    (StockReleasing, &[SaleFailed]),
    (SaleConfirmed, &[]),
    (SaleFailed, &[]),
];

impl SagaState {
    /// All states, in happy-path order followed by the compensation states.
    pub const ALL: [SagaState; 8] = [
        SaleInitiated,
        StockVerifying,
        StockReserving,
        PaymentProcessing,
        OrderConfirming,
        StockReleasing,
        SaleConfirmed,
        SaleFailed,
    ];

    /// Returns the legal next states.
    pub fn allowed_transitions(&self) -> &'static [SagaState] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
            .unwrap_or(&[])
    }

    /// Returns true if the transition table permits moving to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Returns true for `SaleConfirmed` and `SaleFailed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SaleConfirmed | SaleFailed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true while a saga holds or is acquiring a stock reservation
    /// slot; these are the states contending sagas are arbitrated on.
    pub fn is_contending_for_stock(&self) -> bool {
        matches!(self, StockVerifying | StockReserving)
    }

    /// The next state on the happy path, if any.
    pub fn next_on_happy_path(&self) -> Option<SagaState> {
        match self {
            SaleInitiated => Some(StockVerifying),
            StockVerifying => Some(StockReserving),
            StockReserving => Some(PaymentProcessing),
            PaymentProcessing => Some(OrderConfirming),
            OrderConfirming => Some(SaleConfirmed),
            StockReleasing | SaleConfirmed | SaleFailed => None,
        }
    }

    /// Returns the state name as persisted and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleInitiated => "SALE_INITIATED",
            StockVerifying => "STOCK_VERIFYING",
            StockReserving => "STOCK_RESERVING",
            PaymentProcessing => "PAYMENT_PROCESSING",
            OrderConfirming => "ORDER_CONFIRMING",
            StockReleasing => "STOCK_RELEASING",
            SaleConfirmed => "SALE_CONFIRMED",
            SaleFailed => "SALE_FAILED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown saga state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for SagaState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let mut state = SaleInitiated;
        let mut visited = vec![state];
        while let Some(next) = state.next_on_happy_path() {
            assert!(state.can_transition_to(next), "{state} -> {next}");
            state = next;
            visited.push(state);
        }
        assert_eq!(state, SaleConfirmed);
        assert_eq!(visited.len(), 6);
    }

    #[test]
    fn test_no_step_is_skipped() {
        assert!(!SaleInitiated.can_transition_to(StockReserving));
        assert!(!StockVerifying.can_transition_to(PaymentProcessing));
        assert!(!StockReserving.can_transition_to(OrderConfirming));
        assert!(!PaymentProcessing.can_transition_to(SaleConfirmed));
    }

    #[test]
    fn test_no_backward_transitions() {
        for (i, from) in SagaState::ALL[..5].iter().enumerate() {
            for to in &SagaState::ALL[..=i] {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
        assert!(!StockReleasing.can_transition_to(PaymentProcessing));
    }

    #[test]
    fn test_failure_reachable_from_every_active_state() {
        for state in SagaState::ALL.iter().filter(|s| s.is_active()) {
            assert!(state.can_transition_to(SaleFailed), "{state}");
        }
        for state in SagaState::ALL[..5].iter() {
            assert!(state.can_transition_to(StockReleasing), "{state}");
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in [SaleConfirmed, SaleFailed] {
            assert!(state.is_terminal());
            assert!(state.allowed_transitions().is_empty());
        }
        assert!(!StockReleasing.is_terminal());
    }

    #[test]
    fn test_every_state_reachable_from_initial() {
        let mut reachable = HashSet::new();
        let mut pending = vec![SaleInitiated];
        while let Some(state) = pending.pop() {
            if reachable.insert(state) {
                pending.extend_from_slice(state.allowed_transitions());
            }
        }
        assert_eq!(reachable.len(), SagaState::ALL.len());
    }

    #[test]
    fn test_parse_display_and_serde_agree() {
        for state in SagaState::ALL {
            assert_eq!(state.as_str().parse::<SagaState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("RUNNING".parse::<SagaState>().is_err());
    }

    #[test]
    fn test_contending_states() {
        assert!(StockVerifying.is_contending_for_stock());
        assert!(StockReserving.is_contending_for_stock());
        assert!(!PaymentProcessing.is_contending_for_stock());
        assert!(!SaleInitiated.is_contending_for_stock());
    }
}
