use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::{AttributionResult, StepArtifacts};

/// Opaque run identity, `run_` followed by 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("run_{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Done, skipped and error records never change again.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// Feature toggles submitted with a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionOptions {
    #[serde(default = "default_true")]
    pub hybrid_retrieval: bool,
    #[serde(default = "default_true")]
    pub second_pass: bool,
    #[serde(default)]
    pub related_entities: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AttributionOptions {
    fn default() -> Self {
        Self {
            hybrid_retrieval: true,
            second_pass: true,
            related_entities: false,
        }
    }
}

/// Validated submission parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub ticker: String,
    pub selected_day_et: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nl_query: Option<String>,
    #[serde(default)]
    pub options: AttributionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientProvider,
    FatalProvider,
    Cancelled,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientProvider => "transient_provider",
            Self::FatalProvider => "fatal_provider",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Step that was being worked when the run halted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: u32,
    pub label: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl StepRecord {
    pub fn pending(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            status: StepStatus::Pending,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("status is {status} but has_error is {has_error}")]
    ErrorPayloadMismatch { status: RunStatus, has_error: bool },

    #[error("status is {status} but has_result is {has_result}")]
    ResultPayloadMismatch { status: RunStatus, has_result: bool },

    #[error("run is done but step {step} is {status}")]
    UnfinishedStepInDoneRun { step: u32, status: StepStatus },

    #[error("step {step} is {status} after an earlier pending step")]
    StepOutOfOrder { step: u32, status: StepStatus },

    #[error("more than one step is running")]
    MultipleRunningSteps,

    #[error("step records changed shape (expected id {expected} at position {position})")]
    StepShapeChanged { position: usize, expected: u32 },

    #[error("current step moved backwards from {from} to {to}")]
    CurrentStepRegressed { from: u32, to: u32 },

    #[error("current step {current} exceeds step count {count}")]
    CurrentStepOutOfRange { current: u32, count: usize },

    #[error("illegal run transition {from} -> {to}")]
    IllegalRunTransition { from: RunStatus, to: RunStatus },

    #[error("illegal transition for step {step}: {from} -> {to}")]
    IllegalStepTransition {
        step: u32,
        from: StepStatus,
        to: StepStatus,
    },
}

/// One invocation of the attribution pipeline for a ticker/day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub params: RunParams,
    pub status: RunStatus,
    /// Id of the step most recently entered, 0 before the first step starts.
    pub current_step: u32,
    pub steps: Vec<StepRecord>,
    pub result: Option<AttributionResult>,
    pub error: Option<RunError>,
    /// Intermediate step outputs, kept so an interrupted run can resume.
    #[serde(default)]
    pub artifacts: StepArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: RunId, params: RunParams, steps: Vec<StepRecord>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            params,
            status: RunStatus::Queued,
            current_step: 0,
            steps,
            result: None,
            error: None,
            artifacts: StepArtifacts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, id: u32) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: u32) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// First step that has not settled yet, in pipeline order.
    pub fn next_unsettled_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| !s.status.is_settled())
    }

    /// Check the invariants that must hold for every published snapshot.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let has_error = self.error.is_some();
        if (self.status == RunStatus::Error) != has_error {
            return Err(InvariantViolation::ErrorPayloadMismatch {
                status: self.status,
                has_error,
            });
        }

        let has_result = self.result.is_some();
        if (self.status == RunStatus::Done) != has_result {
            return Err(InvariantViolation::ResultPayloadMismatch {
                status: self.status,
                has_result,
            });
        }

        if self.status == RunStatus::Done
            && let Some(step) = self
                .steps
                .iter()
                .find(|s| !matches!(s.status, StepStatus::Done | StepStatus::Skipped))
        {
            return Err(InvariantViolation::UnfinishedStepInDoneRun {
                step: step.id,
                status: step.status,
            });
        }

        if self.current_step as usize > self.steps.len() {
            return Err(InvariantViolation::CurrentStepOutOfRange {
                current: self.current_step,
                count: self.steps.len(),
            });
        }

        let mut seen_pending = false;
        let mut running = 0;
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => seen_pending = true,
                status if seen_pending => {
                    return Err(InvariantViolation::StepOutOfOrder {
                        step: step.id,
                        status,
                    });
                }
                StepStatus::Running => running += 1,
                _ => {}
            }
        }
        if running > 1 {
            return Err(InvariantViolation::MultipleRunningSteps);
        }

        Ok(())
    }

    /// Check that `next` is a legal successor of `self`.
    pub fn check_transition(&self, next: &Run) -> Result<(), InvariantViolation> {
        let legal = match (self.status, next.status) {
            (a, b) if a == b => !a.is_terminal() || self == next,
            (RunStatus::Queued, RunStatus::Running | RunStatus::Error) => true,
            (RunStatus::Running, RunStatus::Done | RunStatus::Error) => true,
            _ => false,
        };
        if !legal {
            return Err(InvariantViolation::IllegalRunTransition {
                from: self.status,
                to: next.status,
            });
        }

        if next.current_step < self.current_step {
            return Err(InvariantViolation::CurrentStepRegressed {
                from: self.current_step,
                to: next.current_step,
            });
        }

        if next.steps.len() != self.steps.len() {
            return Err(InvariantViolation::StepShapeChanged {
                position: self.steps.len().min(next.steps.len()),
                expected: self
                    .steps
                    .get(next.steps.len())
                    .map(|s| s.id)
                    .unwrap_or(0),
            });
        }

        for (position, (before, after)) in self.steps.iter().zip(&next.steps).enumerate() {
            if before.id != after.id || before.label != after.label {
                return Err(InvariantViolation::StepShapeChanged {
                    position,
                    expected: before.id,
                });
            }
            let legal = before.status == after.status
                || matches!(
                    (before.status, after.status),
                    (StepStatus::Pending, _) | (StepStatus::Running, _)
                );
            if !legal {
                return Err(InvariantViolation::IllegalStepTransition {
                    step: before.id,
                    from: before.status,
                    to: after.status,
                });
            }
        }

        Ok(())
    }
}
