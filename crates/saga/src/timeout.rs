//! Periodic detection of stalled sagas.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_store::{SagaEventType, SagaRepository, SagaState};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audit::AuditLog;
use crate::compensation::CompensationExecutor;
use crate::config::TimeoutConfig;
use crate::error::{Result, SagaError};

/// A saga the sweeper compensated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedOutSaga {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub elapsed_secs: i64,
    pub budget_secs: u64,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active sagas examined.
    pub scanned: usize,
    pub timed_out: Vec<TimedOutSaga>,
    /// Sagas whose compensation failed and will be picked up next tick.
    pub failed: Vec<SagaId>,
}

/// A saga past the warning ratio of its budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproachingTimeout {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub elapsed_secs: i64,
    pub budget_secs: u64,
    /// Elapsed time as a fraction of the budget.
    pub ratio: f64,
}

/// Configured budget for one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateBudget {
    pub state: SagaState,
    pub budget_secs: u64,
}

fn elapsed_ms(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - updated_at).num_milliseconds().max(0)
}

/// Fails sagas that have not been written for longer than their state's
/// budget.
pub struct TimeoutSweeper<R> {
    repo: Arc<R>,
    compensation: Arc<CompensationExecutor<R>>,
    audit: AuditLog<R>,
    config: TimeoutConfig,
}

impl<R: SagaRepository + 'static> TimeoutSweeper<R> {
    pub fn new(
        repo: Arc<R>,
        compensation: Arc<CompensationExecutor<R>>,
        audit: AuditLog<R>,
        config: TimeoutConfig,
    ) -> Self {
        Self {
            repo,
            compensation,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Runs one sweep against the current time.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Runs one sweep as if the clock read `now`.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let active = self.repo.find_active().await?;
        let mut report = SweepReport {
            scanned: active.len(),
            ..SweepReport::default()
        };

        for saga in active {
            let state = saga.current_state();
            let budget = self.config.budget_for(state);
            let elapsed = elapsed_ms(saga.updated_at(), now);
            if elapsed <= budget.as_millis() as i64 {
                continue;
            }

            let saga_id = saga.saga_id();
            let elapsed_secs = elapsed / 1000;
            let reason = SagaError::Timeout {
                state,
                elapsed_secs,
            }
            .to_string();
            tracing::warn!(%saga_id, %state, elapsed_secs, budget_secs = budget.as_secs(), "saga timed out");
            metrics::counter!("saga_timeouts_total").increment(1);
            self.audit
                .record(
                    saga_id,
                    SagaEventType::Timeout,
                    json!({ "state": state, "elapsed_secs": elapsed_secs, "budget_secs": budget.as_secs() }),
                )
                .await;

            match self.compensation.compensate(saga_id, &reason).await {
                Ok(outcome) if !outcome.already_terminal => {
                    report.timed_out.push(TimedOutSaga {
                        saga_id,
                        state,
                        elapsed_secs,
                        budget_secs: budget.as_secs(),
                    });
                }
                Ok(_) => {
                    tracing::debug!(%saga_id, "saga finalized before the sweeper reached it");
                }
                Err(e) => {
                    tracing::error!(%saga_id, error = %e, "timeout compensation failed");
                    report.failed.push(saga_id);
                }
            }
        }

        if !report.timed_out.is_empty() {
            tracing::info!(
                scanned = report.scanned,
                timed_out = report.timed_out.len(),
                "timeout sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn approaching_timeout(&self) -> Result<Vec<ApproachingTimeout>> {
        self.approaching_timeout_at(Utc::now()).await
    }

    /// Active sagas between the warning ratio and their full budget.
    pub async fn approaching_timeout_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApproachingTimeout>> {
        let mut approaching = Vec::new();
        for saga in self.repo.find_active().await? {
            let budget = self.config.budget_for(saga.current_state());
            let budget_ms = budget.as_millis() as i64;
            if budget_ms == 0 {
                continue;
            }
            let elapsed = elapsed_ms(saga.updated_at(), now);
            let ratio = elapsed as f64 / budget_ms as f64;
            if ratio >= self.config.warning_ratio && elapsed <= budget_ms {
                approaching.push(ApproachingTimeout {
                    saga_id: saga.saga_id(),
                    state: saga.current_state(),
                    elapsed_secs: elapsed / 1000,
                    budget_secs: budget.as_secs(),
                    ratio,
                });
            }
        }
        Ok(approaching)
    }

    /// Budget for every non-terminal state.
    pub fn timeout_budgets(&self) -> Vec<StateBudget> {
        SagaState::ALL
            .into_iter()
            .filter(|state| !state.is_terminal())
            .map(|state| StateBudget {
                state,
                budget_secs: self.config.budget_for(state).as_secs(),
            })
            .collect()
    }

    /// Starts sweeping every `sweep_interval` on its own task.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let period = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            tracing::info!(interval_ms = period.as_millis() as u64, "timeout sweeper started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "timeout sweep failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            tracing::info!("timeout sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the sweeper and waits for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "timeout sweeper task failed");
        }
    }
}
