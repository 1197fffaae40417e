//! Outbound collaborators used by the pipeline steps.
//!
//! Each concern sits behind its own async trait so steps can be exercised
//! with test doubles. `OfflineProviders` is the deterministic default set.

pub mod offline;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use eventsense_common::{
    AuditFinding, EventIr, EvidenceItem, Judgement, MarketWindows, RawEvent, RetrievalMode,
    Timeframe,
};

use crate::errors::ProviderError;

pub use offline::OfflineProviders;

/// One retrieval call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub ticker: String,
    pub day: NaiveDate,
    pub windows: MarketWindows,
    pub timeframe: Timeframe,
    pub mode: RetrievalMode,
    /// 1 for the initial retrieval, 2 for the second pass.
    pub pass: u8,
    /// Set when fetching for a directly related entity of the subject.
    pub via_entity: Option<String>,
}

#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError>;
}

#[async_trait]
pub trait MiningProvider: Send + Sync {
    async fn extract(
        &self,
        windows: &MarketWindows,
        events: &[RawEvent],
    ) -> Result<EventIr, ProviderError>;
}

#[async_trait]
pub trait AuditProvider: Send + Sync {
    async fn audit(&self, event_ir: &EventIr) -> Result<Vec<AuditFinding>, ProviderError>;
}

#[async_trait]
pub trait JudgingProvider: Send + Sync {
    async fn judge(
        &self,
        event_ir: &EventIr,
        findings: &[AuditFinding],
        evidence: &[EvidenceItem],
        nl_query: Option<&str>,
    ) -> Result<Judgement, ProviderError>;
}

/// The provider set a pipeline runs against.
#[derive(Clone)]
pub struct Providers {
    pub retrieval: Arc<dyn RetrievalProvider>,
    pub mining: Arc<dyn MiningProvider>,
    pub audit: Arc<dyn AuditProvider>,
    pub judging: Arc<dyn JudgingProvider>,
}

impl Providers {
    /// All four concerns served by the offline implementation.
    pub fn offline() -> Self {
        Self::from_offline(OfflineProviders::default())
    }

    pub fn from_offline(offline: OfflineProviders) -> Self {
        let offline = Arc::new(offline);
        Self {
            retrieval: offline.clone(),
            mining: offline.clone(),
            audit: offline.clone(),
            judging: offline,
        }
    }

    pub fn with_retrieval(mut self, provider: Arc<dyn RetrievalProvider>) -> Self {
        self.retrieval = provider;
        self
    }

    pub fn with_mining(mut self, provider: Arc<dyn MiningProvider>) -> Self {
        self.mining = provider;
        self
    }

    pub fn with_audit(mut self, provider: Arc<dyn AuditProvider>) -> Self {
        self.audit = provider;
        self
    }

    pub fn with_judging(mut self, provider: Arc<dyn JudgingProvider>) -> Self {
        self.judging = provider;
        self
    }
}

impl Default for Providers {
    fn default() -> Self {
        Self::offline()
    }
}
