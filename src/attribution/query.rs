//! Query Facade: read-only projections of run snapshots.
//!
//! Every projection is built from one `Arc<Run>` snapshot, so two calls with
//! no update in between serialize identically.

use chrono::{DateTime, Utc};
use eventsense_common::{
    EvidenceItem, RankedCause, Run, RunError, RunId, RunStatus, StepRecord,
};
use serde::{Deserialize, Serialize};

use super::export::{self, IrView, PdfDocument};
use super::store::RunStore;
use crate::errors::AttributionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_step: u32,
    pub steps: Vec<StepRecord>,
    pub error: Option<RunError>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Run> for StatusView {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            current_step: run.current_step,
            steps: run.steps.clone(),
            error: run.error.clone(),
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub results: Vec<RankedCause>,
    pub evidence_timeline: Vec<EvidenceItem>,
    pub ir: IrView,
}

impl From<&Run> for ResultView {
    fn from(run: &Run) -> Self {
        match &run.result {
            Some(result) => Self {
                run_id: run.run_id.clone(),
                status: run.status,
                results: result.results.clone(),
                evidence_timeline: result.evidence_timeline.clone(),
                ir: IrView::from_result(Some(result)),
            },
            None => Self {
                run_id: run.run_id.clone(),
                status: run.status,
                results: Vec::new(),
                evidence_timeline: Vec::new(),
                ir: IrView::pending(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrExport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub ir: IrView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfExport {
    pub run_id: RunId,
    pub pdf: PdfDocument,
}

#[derive(Clone)]
pub struct QueryFacade {
    store: RunStore,
}

impl QueryFacade {
    pub fn new(store: RunStore) -> Self {
        Self { store }
    }

    fn snapshot(&self, run_id: &RunId) -> Result<std::sync::Arc<Run>, AttributionError> {
        self.store
            .get(run_id)
            .ok_or_else(|| AttributionError::NotFound {
                run_id: run_id.clone(),
            })
    }

    pub fn status(&self, run_id: &RunId) -> Result<StatusView, AttributionError> {
        Ok(StatusView::from(self.snapshot(run_id)?.as_ref()))
    }

    /// Result payload, or an empty shape while the run is not done.
    pub fn result(&self, run_id: &RunId) -> Result<ResultView, AttributionError> {
        Ok(ResultView::from(self.snapshot(run_id)?.as_ref()))
    }

    pub fn export_ir(&self, run_id: &RunId) -> Result<IrExport, AttributionError> {
        let run = self.snapshot(run_id)?;
        Ok(IrExport {
            run_id: run.run_id.clone(),
            status: run.status,
            ir: IrView::from_result(run.result.as_ref()),
        })
    }

    pub fn export_pdf(&self, run_id: &RunId) -> Result<PdfExport, AttributionError> {
        let run = self.snapshot(run_id)?;
        Ok(PdfExport {
            run_id: run.run_id.clone(),
            pdf: export::pdf_outline(&run),
        })
    }
}
