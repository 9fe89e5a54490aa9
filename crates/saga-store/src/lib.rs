//! Persistence for sale sagas.
//!
//! One `SagaExecution` row per transaction attempt, written exclusively
//! through compare-and-swap updates on its `version` column, plus an
//! append-only `SagaEventRecord` audit trail. Two backends share the
//! [`SagaRepository`] contract: [`InMemorySagaStore`] for tests and
//! single-process deployments, and [`PostgresSagaStore`].

pub mod error;
pub mod event;
pub mod execution;
pub mod memory;
pub mod postgres;
pub mod state;
pub mod store;

pub use common::{CustomerId, Money, ProductId, SagaId};
pub use error::{Result, StoreError};
pub use event::{EventId, SagaEventRecord, SagaEventType};
pub use execution::{DEFAULT_PAYMENT_METHOD, SagaExecution, Version};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use state::SagaState;
pub use store::{SagaMutation, SagaRepository, SagaRepositoryExt};
