//! Typed error hierarchy for EventSense.
//!
//! - `ValidationError`: rejected submissions (no run is created)
//! - `ProviderError`: outbound collaborator failures inside a step
//! - `StoreError`: run store and persistence failures
//! - `PipelineError`: malformed pipeline definitions
//! - `AttributionError`: what inbound callers see

use eventsense_common::{ErrorKind, InvariantViolation, RunId};
use thiserror::Error;

/// Errors from submission validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Ticker must not be empty")]
    EmptyTicker,

    #[error("Invalid ticker '{0}': expected 1-10 characters of A-Z, 0-9, '.' or '-' starting with a letter")]
    InvalidTicker(String),

    #[error("Malformed date '{0}': expected YYYY-MM-DD")]
    MalformedDate(String),

    #[error("Date {0} cannot be resolved against the US/Eastern exchange calendar")]
    UnresolvableDate(String),
}

/// Errors returned by retrieval, mining, audit and judging providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Fatal provider error: {0}")]
    Fatal(String),

    #[error("Provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {run_id} not found")]
    NotFound { run_id: RunId },

    #[error("Run {run_id} already exists")]
    AlreadyExists { run_id: RunId },

    #[error("Run {run_id} is terminal and can no longer change")]
    Terminal { run_id: RunId },

    #[error("Run {run_id} is still active")]
    Active { run_id: RunId },

    #[error("Run {run_id} update rejected: {source}")]
    Invariant {
        run_id: RunId,
        #[source]
        source: InvariantViolation,
    },

    #[error("Run {run_id} mutation failed: {message}")]
    Mutation { run_id: RunId, message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),
}

/// Errors from building a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Pipeline has no steps")]
    Empty,

    #[error("Step at position {position} has id {found}, expected {expected}")]
    NonContiguousIds {
        position: usize,
        expected: u32,
        found: u32,
    },

    #[error("Pipeline must end with exactly one result-writing step")]
    MissingResultStep,

    #[error("Step {id} writes the result but is not the last step")]
    ResultStepNotLast { id: u32 },
}

/// Errors surfaced to inbound callers (HTTP layer, CLI).
#[derive(Debug, Error)]
pub enum AttributionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Run {run_id} not found")]
    NotFound { run_id: RunId },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AttributionError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(_) => Some(ErrorKind::Validation),
            Self::NotFound { .. } => Some(ErrorKind::NotFound),
            Self::Store(StoreError::NotFound { .. }) => Some(ErrorKind::NotFound),
            _ => None,
        }
    }
}

impl From<StoreError> for AttributionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { run_id } => Self::NotFound { run_id },
            other => Self::Store(other),
        }
    }
}
