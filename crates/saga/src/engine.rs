//! Assembles the saga components from one configuration.

use std::sync::Arc;

use saga_store::SagaRepository;

use crate::audit::AuditLog;
use crate::compensation::CompensationExecutor;
use crate::concurrency::ConcurrencyCoordinator;
use crate::config::SagaConfig;
use crate::orchestrator::SagaOrchestrator;
use crate::services::{InventoryService, OrderService, PaymentService, ServiceGateway};
use crate::timeout::TimeoutSweeper;

/// Every saga component, sharing one repository and one gateway.
pub struct SagaEngine<R> {
    repo: Arc<R>,
    gateway: Arc<ServiceGateway>,
    coordinator: Arc<ConcurrencyCoordinator<R>>,
    orchestrator: Arc<SagaOrchestrator<R>>,
    compensation: Arc<CompensationExecutor<R>>,
    sweeper: Arc<TimeoutSweeper<R>>,
}

impl<R: SagaRepository + 'static> SagaEngine<R> {
    pub fn new(
        repo: Arc<R>,
        inventory: Arc<dyn InventoryService>,
        payment: Arc<dyn PaymentService>,
        order: Arc<dyn OrderService>,
        config: SagaConfig,
    ) -> Self {
        let gateway = Arc::new(ServiceGateway::new(
            inventory,
            payment,
            order,
            &config.services,
        ));
        let audit = AuditLog::new(repo.clone());
        let coordinator = Arc::new(ConcurrencyCoordinator::new(
            repo.clone(),
            config.concurrency,
            config.optimistic_retry,
        ));
        let compensation = Arc::new(CompensationExecutor::new(
            repo.clone(),
            coordinator.clone(),
            gateway.clone(),
            audit.clone(),
        ));
        let orchestrator = Arc::new(SagaOrchestrator::new(
            repo.clone(),
            coordinator.clone(),
            gateway.clone(),
            compensation.clone(),
            audit.clone(),
        ));
        let sweeper = Arc::new(TimeoutSweeper::new(
            repo.clone(),
            compensation.clone(),
            audit,
            config.timeouts,
        ));

        Self {
            repo,
            gateway,
            coordinator,
            orchestrator,
            compensation,
            sweeper,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn gateway(&self) -> &Arc<ServiceGateway> {
        &self.gateway
    }

    pub fn coordinator(&self) -> &Arc<ConcurrencyCoordinator<R>> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &Arc<SagaOrchestrator<R>> {
        &self.orchestrator
    }

    pub fn compensation(&self) -> &Arc<CompensationExecutor<R>> {
        &self.compensation
    }

    pub fn sweeper(&self) -> &Arc<TimeoutSweeper<R>> {
        &self.sweeper
    }
}
