use serde::{Deserialize, Serialize};

/// Monetary amount stored as integer cents to avoid floating-point drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates an amount from a number of cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Creates an amount from whole currency units.
    pub fn from_dollars(dollars: i64) -> Self {
        Self(dollars * 100)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}
