//! End-to-end run scenarios against the orchestrator with scripted providers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventsense::attribution::db::{DbHandle, RunDb};
use eventsense::attribution::events::RunEvent;
use eventsense::attribution::pipeline::PipelineDefinition;
use eventsense::attribution::providers::{
    FetchRequest, MiningProvider, OfflineProviders, Providers, RetrievalProvider,
};
use eventsense::attribution::query::QueryFacade;
use eventsense::attribution::runner::{ExecutionPolicy, RunOrchestrator};
use eventsense::attribution::store::RunStore;
use eventsense::attribution::submission::SubmitRequest;
use eventsense::errors::ProviderError;
use eventsense_common::{
    AttributionOptions, ErrorKind, EventIr, MarketWindows, RawEvent, Run, RunId, RunStatus,
    StepStatus,
};
use tokio::sync::Semaphore;

// ── Scripted providers ───────────────────────────────────────────────

/// Fails the first `failures` initial-retrieval calls, then delegates.
struct FlakyRetrieval {
    failures: u32,
    calls: AtomicU32,
    inner: OfflineProviders,
}

impl FlakyRetrieval {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            inner: OfflineProviders::default(),
        }
    }
}

#[async_trait]
impl RetrievalProvider for FlakyRetrieval {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError> {
        if request.pass == 1 {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ProviderError::Transient("feed returned 503".to_string()));
            }
        }
        self.inner.fetch(request).await
    }
}

/// Sleeps past the step timeout on the first `slow_calls` calls.
struct SlowRetrieval {
    slow_calls: u32,
    delay: Duration,
    calls: AtomicU32,
    inner: OfflineProviders,
}

#[async_trait]
impl RetrievalProvider for SlowRetrieval {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.slow_calls {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch(request).await
    }
}

/// Blocks initial retrieval until the gate is opened.
struct GatedRetrieval {
    gate: Arc<Semaphore>,
    inner: OfflineProviders,
}

#[async_trait]
impl RetrievalProvider for GatedRetrieval {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError> {
        if request.pass == 1 {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| ProviderError::Fatal(e.to_string()))?;
            permit.forget();
        }
        self.inner.fetch(request).await
    }
}

/// Records every request it serves.
#[derive(Default)]
struct RecordingRetrieval {
    requests: Mutex<Vec<FetchRequest>>,
    inner: OfflineProviders,
}

impl RecordingRetrieval {
    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalProvider for RecordingRetrieval {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.fetch(request).await
    }
}

struct BrokenMining;

#[async_trait]
impl MiningProvider for BrokenMining {
    async fn extract(
        &self,
        _windows: &MarketWindows,
        _events: &[RawEvent],
    ) -> Result<EventIr, ProviderError> {
        Err(ProviderError::Fatal("extraction model rejected input".to_string()))
    }
}

/// Never returns until the gate is opened.
struct StuckMining {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl MiningProvider for StuckMining {
    async fn extract(
        &self,
        _windows: &MarketWindows,
        _events: &[RawEvent],
    ) -> Result<EventIr, ProviderError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ProviderError::Fatal(e.to_string()))?;
        Err(ProviderError::Fatal("gate opened".to_string()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn fast_policy() -> ExecutionPolicy {
    ExecutionPolicy {
        step_timeout: Duration::from_secs(5),
        max_transient_retries: 2,
        retry_backoff: Duration::from_millis(5),
    }
}

fn orchestrator(store: RunStore, providers: Providers) -> RunOrchestrator {
    orchestrator_with(store, providers, fast_policy())
}

fn orchestrator_with(
    store: RunStore,
    providers: Providers,
    policy: ExecutionPolicy,
) -> RunOrchestrator {
    RunOrchestrator::new(store, PipelineDefinition::attribution(), providers, policy)
}

/// Poll the store until `pred` holds for the run.
async fn wait_until(store: &RunStore, run_id: &RunId, pred: impl Fn(&Run) -> bool) -> Arc<Run> {
    for _ in 0..1000 {
        if let Some(run) = store.get(run_id)
            && pred(&run)
        {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached for {}", run_id);
}

fn statuses(run: &Run) -> Vec<StepStatus> {
    run.steps.iter().map(|s| s.status).collect()
}

/// Settled steps form a prefix, followed by at most one running step,
/// followed only by pending steps.
fn assert_prefix_shape(statuses: &[StepStatus]) {
    let mut phase = 0;
    for status in statuses {
        let rank = match status {
            StepStatus::Done | StepStatus::Skipped | StepStatus::Error => 0,
            StepStatus::Running => 1,
            StepStatus::Pending => 2,
        };
        assert!(rank >= phase, "steps out of order: {:?}", statuses);
        if rank == 1 {
            assert!(phase < 1, "more than one running step: {:?}", statuses);
            phase = 2;
        } else {
            phase = phase.max(rank);
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn submit_returns_queued_snapshot_immediately() {
    let gate = Arc::new(Semaphore::new(0));
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(Arc::new(GatedRetrieval {
            gate: gate.clone(),
            inner: OfflineProviders::default(),
        })),
    );

    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.current_step, 0);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));
    assert!(run.result.is_none() && run.error.is_none());

    gate.add_permits(10);
    let done = orch.wait(&run.run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Done);
}

#[tokio::test]
async fn msft_run_completes_with_ranked_causes() {
    let store = RunStore::in_memory();
    let orch = orchestrator(store.clone(), Providers::offline());
    let run = orch
        .submit(SubmitRequest::new("MSFT", "2024-02-01").with_query("why did it jump after hours"))
        .await
        .unwrap();
    let done = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.current_step, 6);
    assert!(done.steps.iter().all(|s| s.status == StepStatus::Done));
    let result = done.result.as_ref().unwrap();
    assert!(!result.results.is_empty() && result.results.len() <= 3);
    for (i, cause) in result.results.iter().enumerate() {
        assert_eq!(cause.rank as usize, i + 1);
        assert!(!cause.citations.is_empty());
    }
    for pair in result.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    let times: Vec<_> = result.evidence_timeline.iter().map(|e| e.published_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    let ir = result.ir.as_ref().unwrap();
    assert_eq!(ir.report_ir.ticker, "MSFT");
    assert_eq!(ir.report_ir.nl_query.as_deref(), Some("why did it jump after hours"));
}

#[tokio::test]
async fn every_published_snapshot_keeps_prefix_order() {
    let store = RunStore::in_memory();
    let mut events = store.subscribe();
    let orch = orchestrator(store.clone(), Providers::offline());
    let run = orch
        .submit(SubmitRequest::new("NVDA", "2024-02-01"))
        .await
        .unwrap();

    let mut started = Vec::new();
    let mut finished = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let Some(snapshot) = store.get(&run.run_id) {
            assert_prefix_shape(&statuses(&snapshot));
        }
        match event {
            RunEvent::StepStarted { step, .. } => started.push(step),
            RunEvent::StepFinished { step, .. } => finished.push(step),
            RunEvent::RunFinished { status, .. } => {
                assert_eq!(status, RunStatus::Done);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(started, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(finished, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn second_pass_disabled_skips_step_five() {
    let retrieval = Arc::new(RecordingRetrieval::default());
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(retrieval.clone()),
    );
    let run = orch
        .submit(
            SubmitRequest::new("AAPL", "2024-01-10").with_options(AttributionOptions {
                second_pass: false,
                ..AttributionOptions::default()
            }),
        )
        .await
        .unwrap();
    let done = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(
        statuses(&done),
        vec![
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Skipped,
            StepStatus::Done,
        ]
    );
    assert!(done.steps[4].detail.as_ref().unwrap()["reason"].is_string());
    assert!(retrieval.requests().iter().all(|r| r.pass == 1));
}

#[tokio::test]
async fn related_entities_stay_within_one_hop() {
    let retrieval = Arc::new(RecordingRetrieval::default());
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(retrieval.clone()),
    );
    let run = orch
        .submit(
            SubmitRequest::new("AAPL", "2024-01-10").with_options(AttributionOptions {
                related_entities: true,
                ..AttributionOptions::default()
            }),
        )
        .await
        .unwrap();
    let done = orch.wait(&run.run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Done);

    let requests = retrieval.requests();
    let related = done.artifacts.event_ir.as_ref().unwrap().related_tickers();
    assert!(!related.is_empty());

    let first_pass: Vec<_> = requests.iter().filter(|r| r.pass == 1).collect();
    assert_eq!(first_pass.len(), 1);
    let second_pass: Vec<_> = requests.iter().filter(|r| r.pass == 2).collect();
    assert_eq!(second_pass.len(), 1 + related.len());
    assert!(requests.iter().all(|r| r.pass <= 2));
    for request in second_pass.iter().filter(|r| r.via_entity.is_some()) {
        assert!(related.contains(&request.ticker));
        assert_eq!(request.via_entity.as_deref(), Some(request.ticker.as_str()));
    }
    assert_eq!(done.steps[4].detail.as_ref().unwrap()["passes"], 1);
}

#[tokio::test]
async fn cancel_lets_in_flight_step_finish_and_skips_the_rest() {
    let gate = Arc::new(Semaphore::new(0));
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(Arc::new(GatedRetrieval {
            gate: gate.clone(),
            inner: OfflineProviders::default(),
        })),
    );
    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    wait_until(&store, &run.run_id, |r| {
        r.step(2).is_some_and(|s| s.status == StepStatus::Running)
    })
    .await;

    let snapshot = orch.cancel(&run.run_id).await.unwrap();
    assert!(!snapshot.is_terminal());
    gate.add_permits(10);

    let finished = orch.wait(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Error);
    let error = finished.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert!(finished.result.is_none());
    assert_eq!(
        statuses(&finished),
        vec![
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
        ]
    );

    // Cancelling again is a no-op on the terminal run.
    let again = orch.cancel(&run.run_id).await.unwrap();
    assert_eq!(again.as_ref(), finished.as_ref());
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_before_first_step_skips_every_step() {
    let store = RunStore::in_memory();
    let mut events = store.subscribe();
    let orch = orchestrator(store.clone(), Providers::offline());

    // The spawned task is not polled until this task yields.
    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    let snapshot = orch.cancel(&run.run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Queued);

    let finished = orch.wait(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Error);
    assert_eq!(finished.current_step, 0);
    let error = finished.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(error.step, None);
    assert!(finished.result.is_none());
    assert_eq!(statuses(&finished), vec![StepStatus::Skipped; 6]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, RunEvent::RunStarted { .. } | RunEvent::StepStarted { .. })),
        "run must not start: {:?}",
        seen
    );
    assert!(matches!(seen.last(), Some(RunEvent::RunFinished { .. })));
}

#[tokio::test]
async fn fatal_mining_failure_halts_at_step_three() {
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_mining(Arc::new(BrokenMining)),
    );
    let run = orch
        .submit(SubmitRequest::new("MSFT", "2024-02-01"))
        .await
        .unwrap();
    let failed = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(failed.status, RunStatus::Error);
    assert_eq!(failed.current_step, 3);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::FatalProvider);
    assert_eq!(error.step, Some(3));
    assert!(error.detail.contains("extraction model rejected input"));
    assert_eq!(
        statuses(&failed),
        vec![
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Error,
            StepStatus::Pending,
            StepStatus::Pending,
            StepStatus::Pending,
        ]
    );
    assert_eq!(failed.steps[2].detail.as_ref().unwrap()["attempts"], 1);

    let view = QueryFacade::new(store).result(&run.run_id).unwrap();
    assert!(view.results.is_empty());
    assert!(!view.ir.is_ready());
}

#[tokio::test]
async fn transient_retrieval_failures_are_retried() {
    let retrieval = Arc::new(FlakyRetrieval::new(2));
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(retrieval.clone()),
    );
    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    let done = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.steps[1].detail.as_ref().unwrap()["attempts"], 3);
    assert_eq!(retrieval.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_end_as_transient_error() {
    let retrieval = Arc::new(FlakyRetrieval::new(10));
    let store = RunStore::in_memory();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(retrieval.clone()),
    );
    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    let failed = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(failed.status, RunStatus::Error);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::TransientProvider);
    assert_eq!(error.step, Some(2));
    assert!(error.detail.contains("gave up after 3 attempts"));
    assert_eq!(retrieval.calls.load(Ordering::SeqCst), 3);
    assert_eq!(failed.steps[1].status, StepStatus::Error);
}

#[tokio::test]
async fn step_timeout_counts_as_transient() {
    let store = RunStore::in_memory();
    let policy = ExecutionPolicy {
        step_timeout: Duration::from_millis(100),
        max_transient_retries: 2,
        retry_backoff: Duration::from_millis(5),
    };
    let orch = orchestrator_with(
        store.clone(),
        Providers::offline().with_retrieval(Arc::new(SlowRetrieval {
            slow_calls: 1,
            delay: Duration::from_secs(2),
            calls: AtomicU32::new(0),
            inner: OfflineProviders::default(),
        })),
        policy,
    );
    let run = orch
        .submit(SubmitRequest::new("AAPL", "2024-01-10"))
        .await
        .unwrap();
    let done = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.steps[1].detail.as_ref().unwrap()["attempts"], 2);
}

#[tokio::test]
async fn projections_are_stable_between_updates() {
    let store = RunStore::in_memory();
    let orch = orchestrator(store.clone(), Providers::offline());
    let run = orch
        .submit(SubmitRequest::new("MSFT", "2024-02-01"))
        .await
        .unwrap();
    orch.wait(&run.run_id).await.unwrap();

    let facade = QueryFacade::new(store);
    let status_a = serde_json::to_string(&facade.status(&run.run_id).unwrap()).unwrap();
    let status_b = serde_json::to_string(&facade.status(&run.run_id).unwrap()).unwrap();
    assert_eq!(status_a, status_b);
    let result_a = serde_json::to_string(&facade.result(&run.run_id).unwrap()).unwrap();
    let result_b = serde_json::to_string(&facade.result(&run.run_id).unwrap()).unwrap();
    assert_eq!(result_a, result_b);
    assert_eq!(
        facade.export_pdf(&run.run_id).unwrap(),
        facade.export_pdf(&run.run_id).unwrap()
    );
}

#[tokio::test]
async fn interrupted_run_resumes_after_settled_steps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");

    // First process: stuck in mining, then stopped.
    let gate = Arc::new(Semaphore::new(0));
    let store = RunStore::open(DbHandle::new(RunDb::new(&path).unwrap()))
        .await
        .unwrap();
    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_mining(Arc::new(StuckMining { gate })),
    );
    let run = orch
        .submit(SubmitRequest::new("MSFT", "2024-02-01"))
        .await
        .unwrap();
    wait_until(&store, &run.run_id, |r| {
        r.step(3).is_some_and(|s| s.status == StepStatus::Running)
    })
    .await;
    assert_eq!(orch.active_tasks().await, 1);
    orch.shutdown().await;
    assert_eq!(orch.active_tasks().await, 0);
    drop(orch);
    drop(store);

    // Second process: reload and resume.
    let retrieval = Arc::new(RecordingRetrieval::default());
    let store = RunStore::open(DbHandle::new(RunDb::new(&path).unwrap()))
        .await
        .unwrap();
    let reloaded = store.get(&run.run_id).unwrap();
    assert_eq!(reloaded.status, RunStatus::Running);
    assert_eq!(reloaded.steps[1].status, StepStatus::Done);
    assert_eq!(reloaded.next_unsettled_step().map(|s| s.id), Some(3));

    let orch = orchestrator(
        store.clone(),
        Providers::offline().with_retrieval(retrieval.clone()),
    );
    assert_eq!(orch.resume_interrupted().await, vec![run.run_id.clone()]);
    let done = orch.wait(&run.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Done);
    assert!(done.steps.iter().all(|s| s.status == StepStatus::Done));
    // Step 2 was settled before the interruption and is not fetched again.
    assert!(retrieval.requests().iter().all(|r| r.pass == 2));
}
