//! Identifier and value types shared across the saga workspace.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{CustomerId, ProductId, SagaId};
