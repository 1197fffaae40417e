//! Read-only renderings of a run snapshot for export collaborators.

use eventsense_common::{AttributionResult, IrBundle, Run, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// IR as exposed to callers: the stored bundle once the run is done,
/// otherwise two empty objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IrView {
    Ready(IrBundle),
    Pending {
        event_ir: Map<String, Value>,
        report_ir: Map<String, Value>,
    },
}

impl IrView {
    pub fn pending() -> Self {
        Self::Pending {
            event_ir: Map::new(),
            report_ir: Map::new(),
        }
    }

    pub fn from_result(result: Option<&AttributionResult>) -> Self {
        match result.and_then(|r| r.ir.as_ref()) {
            Some(bundle) => Self::Ready(bundle.clone()),
            None => Self::pending(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfStatus {
    Ready,
    Pending,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfSection {
    pub heading: String,
    pub lines: Vec<String>,
}

/// Render-ready outline of the attribution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfDocument {
    pub status: PdfStatus,
    pub file_name: String,
    pub title: String,
    pub sections: Vec<PdfSection>,
}

pub fn pdf_outline(run: &Run) -> PdfDocument {
    let ticker = &run.params.ticker;
    let day = run.params.selected_day_et;
    let file_name = format!("eventsense_{}_{}_{}.pdf", ticker, day, run.run_id);
    let title = format!("{} move attribution for {} (ET)", ticker, day);

    let mut run_lines = vec![
        format!("Run: {}", run.run_id),
        format!("Status: {}", run.status),
    ];
    if let Some(query) = &run.params.nl_query {
        run_lines.push(format!("Question: {}", query));
    }
    run_lines.extend(
        run.steps
            .iter()
            .map(|s| format!("Step {} {}: {}", s.id, s.label, s.status)),
    );
    let run_section = PdfSection {
        heading: "Run".to_string(),
        lines: run_lines,
    };

    let (status, mut sections) = match (run.status, &run.result) {
        (RunStatus::Done, Some(result)) => (PdfStatus::Ready, report_sections(result)),
        (RunStatus::Error, _) => {
            let lines = run
                .error
                .iter()
                .map(|e| format!("{}: {}", e.kind, e.detail))
                .collect();
            (
                PdfStatus::Unavailable,
                vec![PdfSection {
                    heading: "Error".to_string(),
                    lines,
                }],
            )
        }
        _ => (PdfStatus::Pending, Vec::new()),
    };
    sections.push(run_section);

    PdfDocument {
        status,
        file_name,
        title,
        sections,
    }
}

fn report_sections(result: &AttributionResult) -> Vec<PdfSection> {
    let mut sections = Vec::new();

    if let Some(ir) = &result.ir {
        let report = &ir.report_ir;
        sections.push(PdfSection {
            heading: "Summary".to_string(),
            lines: vec![
                report.summary.clone(),
                format!(
                    "Audit checks: {} passed, {} failed",
                    report.checks_passed, report.checks_failed
                ),
                format!("Evidence documents: {}", report.evidence_count),
            ],
        });
    }

    let mut causes = Vec::new();
    for cause in &result.results {
        causes.push(format!(
            "{}. {} (score {:.2})",
            cause.rank, cause.headline, cause.score
        ));
        causes.extend(cause.evidence.iter().map(|e| format!("  - {}", e)));
        if !cause.why_ranks.is_empty() {
            causes.push(format!("  Why: {}", cause.why_ranks.join(", ")));
        }
        for c in &cause.citations {
            causes.push(format!("  [{}] {} {}", c.kind, c.domain, c.time));
        }
    }
    sections.push(PdfSection {
        heading: "Top causes".to_string(),
        lines: causes,
    });

    sections.push(PdfSection {
        heading: "Evidence timeline".to_string(),
        lines: result
            .evidence_timeline
            .iter()
            .map(|e| format!("{} [{}] {}: {}", e.time_et, e.source.as_str(), e.domain, e.headline))
            .collect(),
    });

    sections
}
