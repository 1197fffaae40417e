//! Run Orchestrator: drives each run through the pipeline on its own task.
//!
//! Every step boundary is one atomic store update (start, then outcome).
//! Cancellation is cooperative and only observed between steps. Transient
//! failures and timeouts are retried with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eventsense_common::{
    ErrorKind, Run, RunError, RunId, RunStatus, StepArtifacts, StepStatus,
};
use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::events::RunEvent;
use super::pipeline::{FailureKind, PipelineDefinition, RunContext, StepDefinition, StepOutcome};
use super::providers::Providers;
use super::store::RunStore;
use super::submission::SubmitRequest;
use crate::config::PipelineSection;
use crate::errors::{AttributionError, StoreError};

/// Timeout and retry policy applied to every step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub step_timeout: Duration,
    pub max_transient_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::from(&PipelineSection::default())
    }
}

impl From<&PipelineSection> for ExecutionPolicy {
    fn from(section: &PipelineSection) -> Self {
        Self {
            step_timeout: section.step_timeout(),
            max_transient_retries: section.max_transient_retries,
            retry_backoff: section.retry_backoff(),
        }
    }
}

impl ExecutionPolicy {
    /// Delay before retry number `retry` (0-based): `backoff * 2^retry`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.retry_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

/// Handle for an in-flight run task.
struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct OrchestratorInner {
    store: RunStore,
    pipeline: PipelineDefinition,
    providers: Providers,
    policy: ExecutionPolicy,
    /// Map from run_id to the handle of its orchestrator task.
    running: Mutex<HashMap<RunId, RunHandle>>,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl RunOrchestrator {
    pub fn new(
        store: RunStore,
        pipeline: PipelineDefinition,
        providers: Providers,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                pipeline,
                providers,
                policy,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.inner.pipeline
    }

    /// Validate a submission, create the run and start driving it.
    ///
    /// The returned snapshot is the freshly created `queued` run.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Arc<Run>, AttributionError> {
        let params = request.validate()?;
        let run = self
            .inner
            .store
            .create(params, self.inner.pipeline.initial_records())
            .await?;
        tracing::info!(
            run_id = %run.run_id,
            ticker = %run.params.ticker,
            day = %run.params.selected_day_et,
            "Run submitted"
        );
        self.spawn(run.run_id.clone()).await;
        Ok(run)
    }

    async fn spawn(&self, run_id: RunId) {
        let mut running = self.inner.running.lock().await;
        if running.contains_key(&run_id) {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().drive(run_id.clone(), cancel.clone()));
        running.insert(run_id, RunHandle { cancel, task });
    }

    /// Request cancellation. The in-flight step finishes; everything after
    /// it is skipped and the run ends in `error` / `cancelled`. Terminal
    /// runs are returned unchanged.
    pub async fn cancel(&self, run_id: &RunId) -> Result<Arc<Run>, AttributionError> {
        let snapshot = self
            .inner
            .store
            .get(run_id)
            .ok_or_else(|| AttributionError::NotFound {
                run_id: run_id.clone(),
            })?;
        if snapshot.is_terminal() {
            return Ok(snapshot);
        }

        let signalled = {
            let running = self.inner.running.lock().await;
            match running.get(run_id) {
                Some(handle) => {
                    handle.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        tracing::info!(run_id = %run_id, signalled, "Cancellation requested");

        if signalled {
            return Ok(self.inner.store.get(run_id).unwrap_or(snapshot));
        }
        // No task is driving the run (e.g. after a shutdown); settle it here.
        match self.finish_cancelled(run_id).await {
            Ok(run) => Ok(run),
            Err(StoreError::Terminal { .. }) => Ok(self.inner.store.get(run_id).unwrap_or(snapshot)),
            Err(err) => Err(err.into()),
        }
    }

    /// Restart every run left `queued` or `running` by a previous process.
    pub async fn resume_interrupted(&self) -> Vec<RunId> {
        let active = self.inner.store.list_active();
        for run_id in &active {
            let from_step = self
                .inner
                .store
                .get(run_id)
                .and_then(|run| run.next_unsettled_step().map(|step| step.id));
            tracing::info!(run_id = %run_id, ?from_step, "Resuming interrupted run");
            self.spawn(run_id.clone()).await;
        }
        active
    }

    /// Number of runs currently driven by a task.
    pub async fn active_tasks(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Wait until a run reaches a terminal state and return that snapshot.
    pub async fn wait(&self, run_id: &RunId) -> Result<Arc<Run>, AttributionError> {
        let mut events = self.inner.store.subscribe();
        loop {
            let snapshot = self
                .inner
                .store
                .get(run_id)
                .ok_or_else(|| AttributionError::NotFound {
                    run_id: run_id.clone(),
                })?;
            if snapshot.is_terminal() {
                return Ok(snapshot);
            }
            loop {
                match events.recv().await {
                    Ok(RunEvent::RunFinished { run_id: id, .. }) if &id == run_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AttributionError::Other(anyhow::anyhow!(
                            "run store event channel closed"
                        )));
                    }
                }
            }
        }
    }

    /// Abort every run task. Run state is left as is so that a durable
    /// store can resume the runs on the next start.
    pub async fn shutdown(&self) {
        let mut running = self.inner.running.lock().await;
        for (run_id, handle) in running.drain() {
            tracing::info!(run_id = %run_id, "Stopping run task");
            handle.task.abort();
        }
    }

    async fn drive(self, run_id: RunId, cancel: CancellationToken) {
        let span = tracing::info_span!("run", run_id = %run_id);
        async {
            if let Err(err) = self.execute_run(&run_id, &cancel).await {
                tracing::error!(error = %err, "Run aborted by store failure");
                let detail = format!("Run store update failed: {}", err);
                if let Err(err) = self
                    .inner
                    .store
                    .update(&run_id, move |run| {
                        run.status = RunStatus::Error;
                        run.result = None;
                        run.error = Some(RunError {
                            kind: ErrorKind::FatalProvider,
                            detail,
                            step: (run.current_step > 0).then_some(run.current_step),
                        });
                        Ok(())
                    })
                    .await
                {
                    tracing::error!(error = %err, "Failed to record run failure");
                }
            }
        }
        .instrument(span)
        .await;
        self.inner.running.lock().await.remove(&run_id);
    }

    async fn execute_run(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let store = &self.inner.store;
        let Some(run) = store.get(run_id) else {
            return Err(StoreError::NotFound {
                run_id: run_id.clone(),
            });
        };
        if run.is_terminal() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            self.finish_cancelled(run_id).await?;
            return Ok(());
        }

        let params = run.params.clone();
        let mut artifacts = run.artifacts.clone();
        store
            .update(run_id, |run| {
                run.status = RunStatus::Running;
                Ok(())
            })
            .await?;
        tracing::info!("Run started");

        for step in self.inner.pipeline.steps() {
            let settled = store
                .get(run_id)
                .and_then(|run| run.step(step.id).map(|r| r.status.is_settled()))
                .unwrap_or(false);
            if settled {
                continue;
            }
            if cancel.is_cancelled() {
                self.finish_cancelled(run_id).await?;
                return Ok(());
            }

            if !step.requirement.applies(&params.options) {
                let reason = step.requirement.skip_reason();
                let id = step.id;
                store
                    .update(run_id, move |run| {
                        let record = run.step_mut(id).ok_or(format!("no step {}", id))?;
                        record.status = StepStatus::Skipped;
                        record.detail = Some(json!({ "reason": reason }));
                        Ok(())
                    })
                    .await?;
                tracing::info!(step = id, reason, "Step skipped");
                continue;
            }

            let id = step.id;
            store
                .update(run_id, move |run| {
                    run.current_step = run.current_step.max(id);
                    let record = run.step_mut(id).ok_or(format!("no step {}", id))?;
                    record.status = StepStatus::Running;
                    Ok(())
                })
                .await?;
            tracing::info!(step = id, label = %step.label, "Step started");

            let ctx = RunContext {
                run_id: run_id.clone(),
                params: params.clone(),
                artifacts: artifacts.clone(),
                providers: self.inner.providers.clone(),
            };
            let (outcome, attempts) = self.execute_with_retry(step, &ctx).await;

            match outcome {
                StepOutcome::Success(payload) => {
                    let detail = payload.diagnostic(attempts);
                    let result = payload.apply(&mut artifacts);
                    self.record_success(run_id, step, detail, result, artifacts.clone())
                        .await?;
                    tracing::info!(step = id, attempts, "Step done");
                    if step.writes_result {
                        tracing::info!("Run done");
                        return Ok(());
                    }
                }
                StepOutcome::Failure(kind, detail) => {
                    tracing::warn!(step = id, attempts, ?kind, %detail, "Step failed, halting run");
                    self.record_failure(run_id, id, kind, detail, attempts).await?;
                    return Ok(());
                }
                StepOutcome::Cancelled => {
                    tracing::info!(step = id, "Step reported cancellation");
                    self.finish_cancelled(run_id).await?;
                    return Ok(());
                }
            }
        }

        // Only reachable when the result-writing step was already settled.
        if store.get(run_id).is_some_and(|run| !run.is_terminal()) {
            store
                .update(run_id, |run| {
                    run.status = RunStatus::Error;
                    run.error = Some(RunError {
                        kind: ErrorKind::FatalProvider,
                        detail: "Pipeline finished without producing a result".to_string(),
                        step: None,
                    });
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Run one step with per-attempt timeout and transient retries.
    /// Returns the final outcome and the number of attempts made.
    async fn execute_with_retry(
        &self,
        step: &StepDefinition,
        ctx: &RunContext,
    ) -> (StepOutcome, u32) {
        let policy = self.inner.policy;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(policy.step_timeout, step.work.execute(ctx)).await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Failure(
                    FailureKind::Transient,
                    format!("step timed out after {}ms", policy.step_timeout.as_millis()),
                ),
            };
            match outcome {
                StepOutcome::Failure(FailureKind::Transient, detail)
                    if attempt <= policy.max_transient_retries =>
                {
                    let backoff = policy.backoff_for(attempt - 1);
                    tracing::warn!(
                        step = step.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %detail,
                        "Transient step failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                StepOutcome::Failure(FailureKind::Transient, detail) if attempt > 1 => {
                    return (
                        StepOutcome::Failure(
                            FailureKind::Transient,
                            format!("{} (gave up after {} attempts)", detail, attempt),
                        ),
                        attempt,
                    );
                }
                other => return (other, attempt),
            }
        }
    }

    async fn record_success(
        &self,
        run_id: &RunId,
        step: &StepDefinition,
        detail: serde_json::Value,
        result: Option<eventsense_common::AttributionResult>,
        checkpoint: StepArtifacts,
    ) -> Result<Arc<Run>, StoreError> {
        let id = step.id;
        let writes_result = step.writes_result;
        self.inner
            .store
            .update(run_id, move |run| {
                let record = run.step_mut(id).ok_or(format!("no step {}", id))?;
                record.status = StepStatus::Done;
                record.detail = Some(detail);
                run.artifacts = checkpoint;
                if writes_result {
                    let result =
                        result.ok_or_else(|| format!("step {} produced no result", id))?;
                    run.result = Some(result);
                    run.status = RunStatus::Done;
                }
                Ok(())
            })
            .await
    }

    async fn record_failure(
        &self,
        run_id: &RunId,
        id: u32,
        kind: FailureKind,
        detail: String,
        attempts: u32,
    ) -> Result<Arc<Run>, StoreError> {
        self.inner
            .store
            .update(run_id, move |run| {
                let record = run.step_mut(id).ok_or(format!("no step {}", id))?;
                record.status = StepStatus::Error;
                record.detail = Some(json!({ "attempts": attempts, "error": detail }));
                run.status = RunStatus::Error;
                run.error = Some(RunError {
                    kind: kind.into(),
                    detail,
                    step: Some(id),
                });
                Ok(())
            })
            .await
    }

    /// Skip every unsettled step and end the run as cancelled.
    async fn finish_cancelled(&self, run_id: &RunId) -> Result<Arc<Run>, StoreError> {
        let run = self
            .inner
            .store
            .update(run_id, |run| {
                for record in &mut run.steps {
                    if !record.status.is_settled() {
                        record.status = StepStatus::Skipped;
                        record.detail = Some(json!({ "reason": "cancelled" }));
                    }
                }
                run.status = RunStatus::Error;
                run.result = None;
                run.error = Some(RunError {
                    kind: ErrorKind::Cancelled,
                    detail: "Run cancelled".to_string(),
                    step: (run.current_step > 0).then_some(run.current_step),
                });
                Ok(())
            })
            .await?;
        tracing::info!(run_id = %run_id, "Run cancelled");
        Ok(run)
    }
}
