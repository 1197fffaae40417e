//! The six units of work of the attribution pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use eventsense_common::{
    AttributionResult, EvidenceItem, IrBundle, RetrievalMode, StepArtifacts, Timeframe,
};

use super::calendar;
use super::pipeline::{
    FailureKind, PipelineDefinition, Requirement, RunContext, StepDefinition, StepOutcome,
    StepPayload, StepWork,
};
use super::providers::FetchRequest;

/// Labels of the default pipeline, in order. Clients match on these.
pub const STEP_LABELS: [&str; 6] = [
    "ET alignment",
    "Initial retrieval",
    "Miner → Event IR",
    "Critic → Audit checks",
    "Second-pass retrieval (≤1) + optional 1-hop",
    "Judge → Top causes + Report IR",
];

impl PipelineDefinition {
    /// The six-step attribution pipeline.
    pub fn attribution() -> Self {
        let work: [Arc<dyn StepWork>; 6] = [
            Arc::new(AlignStep),
            Arc::new(InitialRetrievalStep),
            Arc::new(MineStep),
            Arc::new(AuditStep),
            Arc::new(SecondPassStep),
            Arc::new(JudgeStep),
        ];
        let steps = STEP_LABELS
            .iter()
            .zip(work)
            .enumerate()
            .map(|(i, (label, work))| {
                let id = i as u32 + 1;
                let step = StepDefinition::new(id, *label, work);
                match id {
                    5 => step.required(Requirement::WhenSecondPass),
                    6 => step.writes_result(),
                    _ => step,
                }
            })
            .collect();
        Self::new(steps).expect("attribution pipeline definition is valid")
    }
}

fn missing(what: &str) -> StepOutcome {
    StepOutcome::Failure(
        FailureKind::Fatal,
        format!("{} missing from earlier steps", what),
    )
}

fn mode(ctx: &RunContext) -> RetrievalMode {
    if ctx.params.options.hybrid_retrieval {
        RetrievalMode::Hybrid
    } else {
        RetrievalMode::Lexical
    }
}

/// Every retrieved document as a time-ordered evidence timeline.
pub fn evidence_timeline(artifacts: &StepArtifacts) -> Vec<EvidenceItem> {
    let mut items: Vec<EvidenceItem> = artifacts
        .all_events()
        .map(|e| EvidenceItem {
            raw_event_id: e.id.clone(),
            published_at: e.published_at,
            time_et: calendar::format_time_et(e.published_at),
            domain: e.domain.clone(),
            source: e.source,
            headline: e.headline.clone(),
            retrieval_pass: e.retrieval_pass,
            via_entity: e.via_entity.clone(),
        })
        .collect();
    items.sort_by(|a, b| {
        a.published_at
            .cmp(&b.published_at)
            .then_with(|| a.raw_event_id.cmp(&b.raw_event_id))
    });
    items
}

pub struct AlignStep;

#[async_trait]
impl StepWork for AlignStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        StepOutcome::Success(StepPayload::Aligned(calendar::align(
            ctx.params.selected_day_et,
        )))
    }
}

pub struct InitialRetrievalStep;

#[async_trait]
impl StepWork for InitialRetrievalStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        let Some(windows) = ctx.artifacts.windows.clone() else {
            return missing("market windows");
        };
        let request = FetchRequest {
            ticker: ctx.params.ticker.clone(),
            day: ctx.params.selected_day_et,
            windows,
            timeframe: Timeframe::Session,
            mode: mode(ctx),
            pass: 1,
            via_entity: None,
        };
        match ctx.providers.retrieval.fetch(&request).await {
            Ok(events) => StepOutcome::Success(StepPayload::Retrieved(events)),
            Err(err) => err.into(),
        }
    }
}

pub struct MineStep;

#[async_trait]
impl StepWork for MineStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        let Some(windows) = &ctx.artifacts.windows else {
            return missing("market windows");
        };
        match ctx
            .providers
            .mining
            .extract(windows, &ctx.artifacts.initial_events)
            .await
        {
            Ok(event_ir) => StepOutcome::Success(StepPayload::Mined(event_ir)),
            Err(err) => err.into(),
        }
    }
}

pub struct AuditStep;

#[async_trait]
impl StepWork for AuditStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        let Some(event_ir) = &ctx.artifacts.event_ir else {
            return missing("event IR");
        };
        match ctx.providers.audit.audit(event_ir).await {
            Ok(findings) => StepOutcome::Success(StepPayload::Audited(findings)),
            Err(err) => err.into(),
        }
    }
}

/// One extra retrieval over the extended window and, when enabled, one
/// fetch per directly related entity. Never more than a single pass and
/// never beyond one hop.
pub struct SecondPassStep;

#[async_trait]
impl StepWork for SecondPassStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        let Some(windows) = &ctx.artifacts.windows else {
            return missing("market windows");
        };
        let Some(event_ir) = &ctx.artifacts.event_ir else {
            return missing("event IR");
        };

        let base = FetchRequest {
            ticker: ctx.params.ticker.clone(),
            day: ctx.params.selected_day_et,
            windows: windows.clone(),
            timeframe: Timeframe::Extended,
            mode: mode(ctx),
            pass: 2,
            via_entity: None,
        };
        let mut events = match ctx.providers.retrieval.fetch(&base).await {
            Ok(events) => events,
            Err(err) => return err.into(),
        };

        let mut hops = Vec::new();
        if ctx.params.options.related_entities {
            for related in event_ir.related_tickers() {
                if related == ctx.params.ticker || hops.contains(&related) {
                    continue;
                }
                let request = FetchRequest {
                    ticker: related.clone(),
                    timeframe: Timeframe::Session,
                    via_entity: Some(related.clone()),
                    ..base.clone()
                };
                match ctx.providers.retrieval.fetch(&request).await {
                    Ok(found) => events.extend(found),
                    Err(err) => return err.into(),
                }
                hops.push(related);
            }
        }

        let mut seen: Vec<&str> = ctx.artifacts.initial_events.iter().map(|e| e.id.as_str()).collect();
        let mut fresh = Vec::with_capacity(events.len());
        for event in &events {
            if !seen.contains(&event.id.as_str()) {
                seen.push(event.id.as_str());
                fresh.push(event.clone());
            }
        }
        StepOutcome::Success(StepPayload::SecondPass {
            events: fresh,
            hops,
        })
    }
}

/// Ranks causes and assembles the final result. The only step that writes it.
pub struct JudgeStep;

#[async_trait]
impl StepWork for JudgeStep {
    async fn execute(&self, ctx: &RunContext) -> StepOutcome {
        let Some(event_ir) = &ctx.artifacts.event_ir else {
            return missing("event IR");
        };
        let evidence = evidence_timeline(&ctx.artifacts);
        let judgement = match ctx
            .providers
            .judging
            .judge(
                event_ir,
                &ctx.artifacts.findings,
                &evidence,
                ctx.params.nl_query.as_deref(),
            )
            .await
        {
            Ok(judgement) => judgement,
            Err(err) => return err.into(),
        };
        StepOutcome::Success(StepPayload::Judged(AttributionResult {
            results: judgement.ranked_causes,
            evidence_timeline: evidence,
            ir: Some(IrBundle {
                event_ir: event_ir.clone(),
                report_ir: judgement.report_ir,
            }),
        }))
    }
}
