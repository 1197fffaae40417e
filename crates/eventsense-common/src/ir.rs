//! Intermediate representations exchanged between pipeline steps.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Exchange-timezone bounded data windows for one selected day.
///
/// All instants are UTC; `utc_offset_minutes` is the US/Eastern offset in
/// effect on the selected day (-300 standard, -240 daylight).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketWindows {
    pub day: NaiveDate,
    pub is_trading_day: bool,
    pub utc_offset_minutes: i32,
    /// Previous weekday's regular close; start of the extended window.
    pub lookback_start: DateTime<Utc>,
    pub premarket_open: DateTime<Utc>,
    pub regular_open: DateTime<Utc>,
    pub regular_close: DateTime<Utc>,
    pub after_hours_close: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    /// Pre-market open through after-hours close of the selected day.
    Session,
    /// Previous close through after-hours close of the selected day.
    Extended,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Extended => "extended",
        }
    }

    pub fn bounds(&self, windows: &MarketWindows) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            Self::Session => (windows.premarket_open, windows.after_hours_close),
            Self::Extended => (windows.lookback_start, windows.after_hours_close),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Hybrid,
    Lexical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Sec,
    News,
    Ir,
    Research,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sec => "SEC",
            Self::News => "News",
            Self::Ir => "IR",
            Self::Research => "Research",
        }
    }

    /// Primary-source filings and company releases outrank secondary coverage.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Sec | Self::Ir)
    }
}

/// One retrieved document before extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub ticker: String,
    pub source: SourceKind,
    pub domain: String,
    pub headline: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    /// 1 for the initial retrieval, 2 for the second pass.
    pub retrieval_pass: u8,
    /// Related entity this document was fetched through (1-hop expansion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_entity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// `subject` for the submitted ticker, `related` for counterparties.
    pub relation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrEvent {
    pub event_id: String,
    pub headline: String,
    pub category: String,
    pub claims: Vec<String>,
    /// Raw event ids supporting this event.
    pub sources: Vec<String>,
    /// Distinct source kinds among `sources`.
    #[serde(default)]
    pub source_kinds: Vec<SourceKind>,
    /// Related entity the supporting documents were fetched through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_entity: Option<String>,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventIr {
    pub ticker: String,
    pub day: NaiveDate,
    pub windows: MarketWindows,
    pub events: Vec<IrEvent>,
    pub entities: Vec<Entity>,
}

impl EventIr {
    pub fn event(&self, event_id: &str) -> Option<&IrEvent> {
        self.events.iter().find(|e| e.event_id == event_id)
    }

    /// Directly connected entities (excludes the subject itself).
    pub fn related_tickers(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| e.relation == "related")
            .filter_map(|e| e.ticker.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCheck {
    TimeProximity,
    SourceAuthority,
    Corroboration,
    NumericImpact,
}

impl AuditCheck {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TimeProximity => "Time Proximity",
            Self::SourceAuthority => "High Authority",
            Self::Corroboration => "Multi-Source",
            Self::NumericImpact => "Numeric Impact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub event_id: String,
    pub check: AuditCheck,
    pub passed: bool,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub raw_event_id: String,
    pub published_at: DateTime<Utc>,
    /// Wall-clock time in the exchange timezone, e.g. `16:05 ET`.
    pub time_et: String,
    pub domain: String,
    pub source: SourceKind,
    pub headline: String,
    pub retrieval_pass: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_entity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub domain: String,
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCause {
    pub rank: u32,
    pub event_id: String,
    pub headline: String,
    pub score: f64,
    pub evidence: Vec<String>,
    pub why_ranks: Vec<String>,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportIr {
    pub ticker: String,
    pub day: NaiveDate,
    pub summary: String,
    pub top_causes: Vec<String>,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub evidence_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nl_query: Option<String>,
}

/// Output of the judging provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub report_ir: ReportIr,
    pub ranked_causes: Vec<RankedCause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrBundle {
    pub event_ir: EventIr,
    pub report_ir: ReportIr,
}

/// Final payload written by the judging step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionResult {
    pub results: Vec<RankedCause>,
    pub evidence_timeline: Vec<EvidenceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir: Option<IrBundle>,
}

/// Outputs accumulated by completed steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<MarketWindows>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_events: Vec<RawEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ir: Option<EventIr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<AuditFinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub second_pass_events: Vec<RawEvent>,
}

impl StepArtifacts {
    /// Every retrieved document in retrieval order.
    pub fn all_events(&self) -> impl Iterator<Item = &RawEvent> {
        self.initial_events.iter().chain(&self.second_pass_events)
    }
}
