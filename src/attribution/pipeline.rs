//! Step Pipeline: a data-driven, ordered list of step definitions.
//!
//! Each step declares its id, label, whether the submitted options require
//! it, whether it writes the final result, and the unit of work to run.
//! Work returns a `StepOutcome`; the orchestrator owns all bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use eventsense_common::{
    AttributionOptions, AttributionResult, AuditFinding, ErrorKind, EventIr, MarketWindows,
    RawEvent, RunId, RunParams, StepArtifacts, StepRecord,
};
use serde_json::{Value, json};

use super::providers::Providers;
use crate::errors::{PipelineError, ProviderError};

/// Whether a step runs for a given options bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Always,
    WhenSecondPass,
}

impl Requirement {
    pub fn applies(&self, options: &AttributionOptions) -> bool {
        match self {
            Self::Always => true,
            Self::WhenSecondPass => options.second_pass,
        }
    }

    /// Reason recorded on a step that was skipped by this requirement.
    pub fn skip_reason(&self) -> &'static str {
        match self {
            Self::Always => "not required",
            Self::WhenSecondPass => "second_pass disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => ErrorKind::TransientProvider,
            FailureKind::Fatal => ErrorKind::FatalProvider,
        }
    }
}

/// Output of one successful step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    Aligned(MarketWindows),
    Retrieved(Vec<RawEvent>),
    Mined(EventIr),
    Audited(Vec<AuditFinding>),
    SecondPass {
        events: Vec<RawEvent>,
        /// Related tickers visited by the 1-hop expansion.
        hops: Vec<String>,
    },
    Judged(AttributionResult),
}

impl StepPayload {
    /// Merge the payload into the artifacts checkpoint. The judged result is
    /// handed back instead of being stored with the artifacts.
    pub fn apply(self, artifacts: &mut StepArtifacts) -> Option<AttributionResult> {
        match self {
            Self::Aligned(windows) => artifacts.windows = Some(windows),
            Self::Retrieved(events) => artifacts.initial_events = events,
            Self::Mined(event_ir) => artifacts.event_ir = Some(event_ir),
            Self::Audited(findings) => artifacts.findings = findings,
            Self::SecondPass { events, .. } => artifacts.second_pass_events = events,
            Self::Judged(result) => return Some(result),
        }
        None
    }

    /// Diagnostic recorded on the step record.
    pub fn diagnostic(&self, attempts: u32) -> Value {
        let mut detail = match self {
            Self::Aligned(w) => json!({
                "trading_day": w.is_trading_day,
                "utc_offset_minutes": w.utc_offset_minutes,
                "regular_open": w.regular_open,
                "regular_close": w.regular_close,
            }),
            Self::Retrieved(events) => json!({ "documents": events.len() }),
            Self::Mined(ir) => json!({
                "events": ir.events.len(),
                "entities": ir.entities.len(),
            }),
            Self::Audited(findings) => json!({
                "checks": findings.len(),
                "passed": findings.iter().filter(|f| f.passed).count(),
            }),
            Self::SecondPass { events, hops } => json!({
                "documents": events.len(),
                "passes": 1,
                "hops": hops,
            }),
            Self::Judged(result) => json!({
                "causes": result.results.len(),
                "evidence": result.evidence_timeline.len(),
            }),
        };
        if let Some(obj) = detail.as_object_mut() {
            obj.insert("attempts".to_string(), json!(attempts));
        }
        detail
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(StepPayload),
    Failure(FailureKind, String),
    Cancelled,
}

impl From<ProviderError> for StepOutcome {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(detail) => Self::Failure(FailureKind::Transient, detail),
            ProviderError::Fatal(detail) => Self::Failure(FailureKind::Fatal, detail),
            ProviderError::Cancelled => Self::Cancelled,
        }
    }
}

/// Everything a step can read. Steps never touch the run store.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub params: RunParams,
    pub artifacts: StepArtifacts,
    pub providers: Providers,
}

#[async_trait]
pub trait StepWork: Send + Sync {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome;
}

#[derive(Clone)]
pub struct StepDefinition {
    pub id: u32,
    pub label: String,
    pub requirement: Requirement,
    pub writes_result: bool,
    pub work: Arc<dyn StepWork>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("requirement", &self.requirement)
            .field("writes_result", &self.writes_result)
            .finish()
    }
}

impl StepDefinition {
    pub fn new(id: u32, label: impl Into<String>, work: Arc<dyn StepWork>) -> Self {
        Self {
            id,
            label: label.into(),
            requirement: Requirement::Always,
            writes_result: false,
            work,
        }
    }

    pub fn required(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn writes_result(mut self) -> Self {
        self.writes_result = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    steps: Vec<StepDefinition>,
}

impl PipelineDefinition {
    /// Validate and build a pipeline: ids run 1..N in order and exactly one
    /// step, the last, writes the result.
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self, PipelineError> {
        if steps.is_empty() {
            return Err(PipelineError::Empty);
        }
        for (position, step) in steps.iter().enumerate() {
            let expected = position as u32 + 1;
            if step.id != expected {
                return Err(PipelineError::NonContiguousIds {
                    position,
                    expected,
                    found: step.id,
                });
            }
        }
        let last = steps.len() - 1;
        if let Some(step) = steps[..last].iter().find(|s| s.writes_result) {
            return Err(PipelineError::ResultStepNotLast { id: step.id });
        }
        if !steps[last].writes_result {
            return Err(PipelineError::MissingResultStep);
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, id: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Pending step records for a new run.
    pub fn initial_records(&self) -> Vec<StepRecord> {
        self.steps
            .iter()
            .map(|s| StepRecord::pending(s.id, s.label.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl StepWork for Noop {
        async fn execute(&self, _ctx: &RunContext) -> StepOutcome {
            StepOutcome::Failure(FailureKind::Fatal, "noop".to_string())
        }
    }

    fn step(id: u32) -> StepDefinition {
        StepDefinition::new(id, format!("step {}", id), Arc::new(Noop))
    }

    #[test]
    fn test_requirement_follows_options() {
        let mut options = AttributionOptions::default();
        assert!(Requirement::WhenSecondPass.applies(&options));
        options.second_pass = false;
        assert!(!Requirement::WhenSecondPass.applies(&options));
        assert!(Requirement::Always.applies(&options));
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = PipelineDefinition::new(vec![step(1), step(2).writes_result()]).unwrap();
        assert_eq!(pipeline.len(), 2);
        let records = pipeline.initial_records();
        assert_eq!(records[1].label, "step 2");
        assert!(records.iter().all(|r| r.status == eventsense_common::StepStatus::Pending));
    }

    #[test]
    fn test_rejects_empty_pipeline() {
        assert_eq!(PipelineDefinition::new(vec![]).unwrap_err(), PipelineError::Empty);
    }

    #[test]
    fn test_rejects_gaps_in_ids() {
        let err = PipelineDefinition::new(vec![step(1), step(3).writes_result()]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::NonContiguousIds {
                position: 1,
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn test_rejects_misplaced_result_step() {
        let err =
            PipelineDefinition::new(vec![step(1).writes_result(), step(2).writes_result()])
                .unwrap_err();
        assert_eq!(err, PipelineError::ResultStepNotLast { id: 1 });
        let err = PipelineDefinition::new(vec![step(1), step(2)]).unwrap_err();
        assert_eq!(err, PipelineError::MissingResultStep);
    }

    #[test]
    fn test_provider_errors_map_to_outcomes() {
        assert_eq!(
            StepOutcome::from(ProviderError::Transient("429".into())),
            StepOutcome::Failure(FailureKind::Transient, "429".into())
        );
        assert_eq!(StepOutcome::from(ProviderError::Cancelled), StepOutcome::Cancelled);
        assert_eq!(ErrorKind::from(FailureKind::Fatal), ErrorKind::FatalProvider);
    }

    #[test]
    fn test_payload_apply_and_diagnostic() {
        let mut artifacts = StepArtifacts::default();
        let payload = StepPayload::SecondPass {
            events: vec![],
            hops: vec!["TSM".to_string()],
        };
        let detail = payload.diagnostic(2);
        assert_eq!(detail["attempts"], 2);
        assert_eq!(detail["passes"], 1);
        assert_eq!(detail["hops"][0], "TSM");
        assert!(payload.apply(&mut artifacts).is_none());

        let result = StepPayload::Judged(AttributionResult::default()).apply(&mut artifacts);
        assert_eq!(result, Some(AttributionResult::default()));
    }
}
