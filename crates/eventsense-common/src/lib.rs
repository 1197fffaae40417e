//! Shared domain types for EventSense attribution runs.
//!
//! `run` holds the run record and its step bookkeeping; `ir` holds the
//! payloads that flow between pipeline steps (raw events, Event IR, audit
//! findings, Report IR) and the final attribution result.

pub mod ir;
pub mod run;

pub use ir::{
    AttributionResult, AuditCheck, AuditFinding, Citation, Entity, EventIr, EvidenceItem,
    IrBundle, IrEvent, Judgement, MarketWindows, RankedCause, RawEvent, ReportIr,
    RetrievalMode, SourceKind, StepArtifacts, Timeframe,
};
pub use run::{
    AttributionOptions, ErrorKind, InvariantViolation, Run, RunError, RunId, RunParams,
    RunStatus, StepRecord, StepStatus,
};
