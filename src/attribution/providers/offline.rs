//! Deterministic providers that need no network access.
//!
//! Documents are synthesised from a SHA-256 digest of ticker, day, pass and
//! index, so the same submission always yields the same run. Mining groups
//! documents by a headline classifier, the critic applies four fixed checks
//! and the judge scores events by the checks they pass.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use eventsense_common::{
    AuditCheck, AuditFinding, Citation, Entity, EventIr, EvidenceItem, IrEvent, Judgement,
    MarketWindows, RankedCause, RawEvent, ReportIr, SourceKind,
};
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{AuditProvider, FetchRequest, JudgingProvider, MiningProvider, RetrievalProvider};
use crate::errors::ProviderError;

/// Ranked causes reported per run.
pub const MAX_CAUSES: usize = 3;

struct Template {
    category: &'static str,
    source: SourceKind,
    domain: &'static str,
    headline: &'static str,
    claim: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        category: "earnings",
        source: SourceKind::Sec,
        domain: "sec.gov",
        headline: "Form 8-K: {ticker} results of operations and financial condition",
        claim: "Quarterly revenue {dir} {pct}% year over year",
    },
    Template {
        category: "earnings",
        source: SourceKind::Ir,
        domain: "ir.{lower}.com",
        headline: "{ticker} reports quarterly earnings",
        claim: "Earnings per share came in {pct}% {side} consensus",
    },
    Template {
        category: "earnings",
        source: SourceKind::News,
        domain: "reuters.com",
        headline: "{ticker} earnings {beat_miss} Wall Street estimates",
        claim: "Shares moved {dir} {pct}% in extended trading after the print",
    },
    Template {
        category: "guidance",
        source: SourceKind::Ir,
        domain: "ir.{lower}.com",
        headline: "{ticker} {raises_cuts} full-year outlook",
        claim: "Full-year revenue guidance {raised_cut} by {pct}%",
    },
    Template {
        category: "guidance",
        source: SourceKind::News,
        domain: "bloomberg.com",
        headline: "{ticker} {raises_cuts} guidance as demand shifts",
        claim: "Management cited {demand} demand in the outlook revision",
    },
    Template {
        category: "analyst",
        source: SourceKind::Research,
        domain: "goldmansachs.com",
        headline: "Goldman Sachs {grades} {ticker}, sets price target ${target}",
        claim: "Price target moves to ${target}",
    },
    Template {
        category: "analyst",
        source: SourceKind::News,
        domain: "cnbc.com",
        headline: "Analyst {grades} {ticker} on margin concerns",
        claim: "Two brokers revised ratings before the open",
    },
    Template {
        category: "product",
        source: SourceKind::Ir,
        domain: "ir.{lower}.com",
        headline: "{ticker} unveils next-generation product line",
        claim: "Launch timing shifts by {months} months",
    },
    Template {
        category: "product",
        source: SourceKind::News,
        domain: "theverge.com",
        headline: "Hands-on with the {ticker} launch lineup",
        claim: "Reviewers flag pricing as a key risk",
    },
    Template {
        category: "regulatory",
        source: SourceKind::Sec,
        domain: "sec.gov",
        headline: "Form 8-K: {ticker} discloses regulatory inquiry",
        claim: "Company received a request for information from regulators",
    },
    Template {
        category: "regulatory",
        source: SourceKind::News,
        domain: "wsj.com",
        headline: "Regulators open probe into {ticker} business practices",
        claim: "Potential fines could reach {pct}% of annual revenue",
    },
    Template {
        category: "macro",
        source: SourceKind::News,
        domain: "federalreserve.gov",
        headline: "Fed minutes signal rate hold amid sector volatility",
        claim: "Treasury yields moved {dir} {bps} basis points",
    },
];

static CLASSIFIERS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("regulatory", r"(?i)\b(inquiry|probe|regulat\w*)\b"),
        ("guidance", r"(?i)\b(outlook|guidance)\b"),
        ("analyst", r"(?i)\b(upgrades?|downgrades?|analysts?|price target)\b"),
        ("earnings", r"(?i)\b(earnings|results of operations)\b"),
        ("product", r"(?i)\b(unveils|launch)\b"),
        ("macro", r"(?i)\b(fed|treasury|rate hold)\b"),
    ]
    .into_iter()
    .filter_map(|(category, pattern)| Regex::new(pattern).ok().map(|re| (category, re)))
    .collect()
});

static NUMERIC_CLAIM: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?%|\$\d+|\d+ basis points").ok());

/// Known first-degree relationships used for the 1-hop expansion.
const RELATED: &[(&str, &[(&str, &str)])] = &[
    ("AAPL", &[("Taiwan Semiconductor", "TSM"), ("Qualcomm", "QCOM")]),
    ("MSFT", &[("NVIDIA", "NVDA"), ("Alphabet", "GOOGL")]),
    ("NVDA", &[("Taiwan Semiconductor", "TSM"), ("Microsoft", "MSFT")]),
    ("AMZN", &[("Microsoft", "MSFT"), ("Alphabet", "GOOGL")]),
    ("GOOGL", &[("Microsoft", "MSFT"), ("Meta Platforms", "META")]),
    ("TSLA", &[("Panasonic", "PCRFY")]),
];

/// Map a headline to an event category.
pub fn classify(headline: &str) -> &'static str {
    CLASSIFIERS
        .iter()
        .find(|(_, re)| re.is_match(headline))
        .map(|(category, _)| *category)
        .unwrap_or("other")
}

fn digest(seed: &str) -> [u8; 32] {
    Sha256::digest(seed.as_bytes()).into()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn render(text: &str, ticker: &str, h: &[u8; 32]) -> String {
    let up = h[8] % 2 == 0;
    let pct = format!("{}.{}", 1 + h[9] % 14, h[10] % 10);
    text.replace("{ticker}", ticker)
        .replace("{lower}", &ticker.to_lowercase())
        .replace("{dir}", if up { "up" } else { "down" })
        .replace("{side}", if up { "above" } else { "below" })
        .replace("{beat_miss}", if up { "beat" } else { "miss" })
        .replace("{raises_cuts}", if up { "raises" } else { "cuts" })
        .replace("{raised_cut}", if up { "raised" } else { "cut" })
        .replace("{grades}", if up { "upgrades" } else { "downgrades" })
        .replace("{demand}", if up { "stronger" } else { "softer" })
        .replace("{pct}", &pct)
        .replace("{target}", &(80 + u32::from(h[11]) * 3).to_string())
        .replace("{months}", &(1 + h[12] % 6).to_string())
        .replace("{bps}", &(5 + h[13] % 20).to_string())
}

/// Offline retrieval, mining, audit and judging.
#[derive(Debug, Clone, Default)]
pub struct OfflineProviders {
    latency: Duration,
}

impl OfflineProviders {
    /// Add an artificial delay to every fetch.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }

    fn related_entities(ticker: &str) -> Vec<Entity> {
        RELATED
            .iter()
            .find(|(subject, _)| *subject == ticker)
            .map(|(_, related)| {
                related
                    .iter()
                    .map(|(name, symbol)| Entity {
                        name: (*name).to_string(),
                        ticker: Some((*symbol).to_string()),
                        relation: "related".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn synthesize(request: &FetchRequest) -> Vec<RawEvent> {
        let via = request.via_entity.as_deref().unwrap_or("");
        let day_seed = digest(&format!("{}|{}", request.ticker, request.day));
        let run_seed = digest(&format!(
            "{}|{}|{}|{}",
            request.ticker, request.day, request.pass, via
        ));
        let count = match (request.pass, request.via_entity.is_some()) {
            (_, true) => 1 + usize::from(run_seed[0] % 2),
            (1, false) => 4 + usize::from(run_seed[0] % 3),
            _ => 2 + usize::from(run_seed[0] % 2),
        };

        // The day's dominant story gets the first documents of every pass so
        // that it is corroborated across sources.
        let categories: Vec<&str> = {
            let mut seen = Vec::new();
            for t in TEMPLATES {
                if !seen.contains(&t.category) {
                    seen.push(t.category);
                }
            }
            seen
        };
        let primary = categories[usize::from(day_seed[0]) % categories.len()];
        let primary_templates: Vec<&Template> =
            TEMPLATES.iter().filter(|t| t.category == primary).collect();

        let (start, end) = request.timeframe.bounds(&request.windows);
        let span_minutes = (end - start).num_minutes().max(1) as u64;

        (0..count)
            .map(|i| {
                let h = digest(&format!(
                    "{}|{}|{}|{}|{}",
                    request.ticker, request.day, request.pass, via, i
                ));
                let template = if i < 2 {
                    primary_templates[(i + usize::from(request.pass)) % primary_templates.len()]
                } else {
                    &TEMPLATES[usize::from(h[1]) % TEMPLATES.len()]
                };
                let offset = u64::from(u32::from_be_bytes([h[2], h[3], h[4], h[5]])) % span_minutes;
                RawEvent {
                    id: format!(
                        "{}-{}",
                        template.source.as_str().to_lowercase(),
                        hex(&h[..6])
                    ),
                    ticker: request.ticker.clone(),
                    source: template.source,
                    domain: render(template.domain, &request.ticker, &h),
                    headline: render(template.headline, &request.ticker, &h),
                    body: render(template.claim, &request.ticker, &h),
                    published_at: start + ChronoDuration::minutes(offset as i64),
                    retrieval_pass: request.pass,
                    via_entity: request.via_entity.clone(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl RetrievalProvider for OfflineProviders {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawEvent>, ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut events = Self::synthesize(request);
        events.sort_by(|a, b| a.published_at.cmp(&b.published_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[async_trait]
impl MiningProvider for OfflineProviders {
    async fn extract(
        &self,
        windows: &MarketWindows,
        events: &[RawEvent],
    ) -> Result<EventIr, ProviderError> {
        let subject = events
            .iter()
            .find(|e| e.via_entity.is_none())
            .map(|e| e.ticker.clone())
            .ok_or_else(|| ProviderError::Fatal("no subject documents to extract from".to_string()))?;

        let mut groups: BTreeMap<(String, Option<String>), Vec<&RawEvent>> = BTreeMap::new();
        for event in events {
            groups
                .entry((classify(&event.headline).to_string(), event.via_entity.clone()))
                .or_default()
                .push(event);
        }

        let mut ir_events: Vec<IrEvent> = groups
            .into_iter()
            .map(|((category, via_entity), members)| {
                let lead = members
                    .iter()
                    .min_by_key(|e| (!e.source.is_authoritative(), e.published_at))
                    .copied()
                    .unwrap_or(members[0]);
                let mut claims: Vec<String> = Vec::new();
                let mut source_kinds: Vec<SourceKind> = Vec::new();
                for member in &members {
                    if !claims.contains(&member.body) {
                        claims.push(member.body.clone());
                    }
                    if !source_kinds.contains(&member.source) {
                        source_kinds.push(member.source);
                    }
                }
                let event_id = match &via_entity {
                    Some(via) => format!("evt_{}_{}", category, via.to_lowercase()),
                    None => format!("evt_{}", category),
                };
                IrEvent {
                    event_id,
                    headline: lead.headline.clone(),
                    category,
                    claims,
                    sources: members.iter().map(|e| e.id.clone()).collect(),
                    source_kinds,
                    via_entity,
                    first_seen: members
                        .iter()
                        .map(|e| e.published_at)
                        .min()
                        .unwrap_or(lead.published_at),
                }
            })
            .collect();
        ir_events.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.event_id.cmp(&b.event_id)));

        let mut entities = vec![Entity {
            name: subject.clone(),
            ticker: Some(subject.clone()),
            relation: "subject".to_string(),
        }];
        entities.extend(Self::related_entities(&subject));

        Ok(EventIr {
            ticker: subject,
            day: windows.day,
            windows: windows.clone(),
            events: ir_events,
            entities,
        })
    }
}

#[async_trait]
impl AuditProvider for OfflineProviders {
    async fn audit(&self, event_ir: &EventIr) -> Result<Vec<AuditFinding>, ProviderError> {
        let windows = &event_ir.windows;
        let mut findings = Vec::with_capacity(event_ir.events.len() * 4);
        for event in &event_ir.events {
            let in_session = event.first_seen >= windows.premarket_open
                && event.first_seen <= windows.after_hours_close;
            let authoritative = event.source_kinds.iter().any(|k| k.is_authoritative());
            let numeric = event
                .claims
                .iter()
                .find(|claim| NUMERIC_CLAIM.as_ref().is_some_and(|re| re.is_match(claim)));

            findings.push(AuditFinding {
                event_id: event.event_id.clone(),
                check: AuditCheck::TimeProximity,
                passed: in_session,
                note: if in_session {
                    "first seen inside the trading session".to_string()
                } else {
                    "first seen before the session opened".to_string()
                },
            });
            findings.push(AuditFinding {
                event_id: event.event_id.clone(),
                check: AuditCheck::SourceAuthority,
                passed: authoritative,
                note: format!(
                    "sources: {}",
                    event
                        .source_kinds
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
            findings.push(AuditFinding {
                event_id: event.event_id.clone(),
                check: AuditCheck::Corroboration,
                passed: event.sources.len() >= 2,
                note: format!("{} supporting documents", event.sources.len()),
            });
            findings.push(AuditFinding {
                event_id: event.event_id.clone(),
                check: AuditCheck::NumericImpact,
                passed: numeric.is_some(),
                note: numeric
                    .cloned()
                    .unwrap_or_else(|| "no quantified claim".to_string()),
            });
        }
        Ok(findings)
    }
}

fn check_weight(check: AuditCheck) -> f64 {
    match check {
        AuditCheck::TimeProximity => 0.3,
        AuditCheck::SourceAuthority => 0.3,
        AuditCheck::Corroboration => 0.25,
        AuditCheck::NumericImpact => 0.15,
    }
}

fn query_terms(nl_query: Option<&str>) -> Vec<String> {
    nl_query
        .map(|q| {
            q.split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.len() > 3)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl JudgingProvider for OfflineProviders {
    async fn judge(
        &self,
        event_ir: &EventIr,
        findings: &[AuditFinding],
        evidence: &[EvidenceItem],
        nl_query: Option<&str>,
    ) -> Result<Judgement, ProviderError> {
        let terms = query_terms(nl_query);

        let mut scored: Vec<(f64, RankedCause)> = event_ir
            .events
            .iter()
            .map(|event| {
                let passed: Vec<AuditCheck> = findings
                    .iter()
                    .filter(|f| f.event_id == event.event_id && f.passed)
                    .map(|f| f.check)
                    .collect();
                let mut score: f64 = passed.iter().copied().map(check_weight).sum();
                let mut why_ranks: Vec<String> =
                    passed.iter().map(|c| c.label().to_string()).collect();

                // Later documents of the same story that the second pass or
                // the 1-hop expansion brought in.
                let supporting: Vec<&EvidenceItem> = evidence
                    .iter()
                    .filter(|item| {
                        event.sources.contains(&item.raw_event_id)
                            || (item.retrieval_pass > 1
                                && item.via_entity == event.via_entity
                                && classify(&item.headline) == event.category)
                    })
                    .collect();
                if supporting.iter().any(|item| item.retrieval_pass > 1) {
                    score += 0.05;
                    why_ranks.push("Second-Pass Confirmation".to_string());
                }
                if event.via_entity.is_some() {
                    score *= 0.8;
                    why_ranks.push("Related Entity".to_string());
                }
                let headline = event.headline.to_lowercase();
                if terms.iter().any(|t| headline.contains(t.as_str())) {
                    score += 0.1;
                    why_ranks.push("Query Match".to_string());
                }

                let citations = supporting
                    .iter()
                    .map(|item| Citation {
                        domain: item.domain.clone(),
                        time: item.time_et.clone(),
                        kind: item.source.as_str().to_string(),
                    })
                    .collect();
                let score = (score * 100.0).round() / 100.0;
                (
                    score,
                    RankedCause {
                        rank: 0,
                        event_id: event.event_id.clone(),
                        headline: event.headline.clone(),
                        score,
                        evidence: event.claims.clone(),
                        why_ranks,
                        citations,
                    },
                )
            })
            .collect();

        scored.sort_by(|(a, ca), (b, cb)| {
            b.total_cmp(a)
                .then_with(|| ca.event_id.cmp(&cb.event_id))
        });
        let ranked_causes: Vec<RankedCause> = scored
            .into_iter()
            .take(MAX_CAUSES)
            .enumerate()
            .map(|(i, (_, mut cause))| {
                cause.rank = i as u32 + 1;
                cause
            })
            .collect();

        let checks_passed = findings.iter().filter(|f| f.passed).count() as u32;
        let summary = match ranked_causes.first() {
            Some(top) => format!(
                "{} on {}: {} candidate events; leading cause: {}",
                event_ir.ticker,
                event_ir.day,
                event_ir.events.len(),
                top.headline
            ),
            None => format!(
                "{} on {}: no attributable events found",
                event_ir.ticker, event_ir.day
            ),
        };

        Ok(Judgement {
            report_ir: ReportIr {
                ticker: event_ir.ticker.clone(),
                day: event_ir.day,
                summary,
                top_causes: ranked_causes.iter().map(|c| c.event_id.clone()).collect(),
                checks_passed,
                checks_failed: findings.len() as u32 - checks_passed,
                evidence_count: evidence.len() as u32,
                nl_query: nl_query.map(str::to_string),
            },
            ranked_causes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::calendar;
    use chrono::NaiveDate;
    use eventsense_common::{RetrievalMode, Timeframe};

    fn request(ticker: &str, pass: u8, via: Option<&str>) -> FetchRequest {
        let day = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        FetchRequest {
            ticker: ticker.to_string(),
            day,
            windows: calendar::align(day),
            timeframe: if pass == 1 {
                Timeframe::Session
            } else {
                Timeframe::Extended
            },
            mode: RetrievalMode::Hybrid,
            pass,
            via_entity: via.map(str::to_string),
        }
    }

    fn evidence(events: &[RawEvent]) -> Vec<EvidenceItem> {
        events
            .iter()
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
            .collect()
    }

    #[test]
    fn test_classify_headlines() {
        assert_eq!(classify("Form 8-K: MSFT results of operations and financial condition"), "earnings");
        assert_eq!(classify("MSFT cuts full-year outlook"), "guidance");
        assert_eq!(classify("Goldman Sachs downgrades MSFT, sets price target $120"), "analyst");
        assert_eq!(classify("Regulators open probe into MSFT business practices"), "regulatory");
        assert_eq!(classify("Fed minutes signal rate hold amid sector volatility"), "macro");
        assert_eq!(classify("Something unrelated"), "other");
    }

    #[test]
    fn test_every_template_classifies_to_its_category() {
        let h = digest("seed");
        for template in TEMPLATES {
            let headline = render(template.headline, "MSFT", &h);
            assert_eq!(classify(&headline), template.category, "{}", headline);
        }
    }

    #[tokio::test]
    async fn test_fetch_is_deterministic_and_within_bounds() {
        let provider = OfflineProviders::default();
        let req = request("MSFT", 1, None);
        let first = provider.fetch(&req).await.unwrap();
        let second = provider.fetch(&req).await.unwrap();
        assert_eq!(first, second);
        assert!((4..=6).contains(&first.len()));
        let (start, end) = req.timeframe.bounds(&req.windows);
        for event in &first {
            assert!(event.published_at >= start && event.published_at <= end);
            assert_eq!(event.retrieval_pass, 1);
        }
    }

    #[tokio::test]
    async fn test_fetch_differs_per_pass() {
        let provider = OfflineProviders::default();
        let first = provider.fetch(&request("MSFT", 1, None)).await.unwrap();
        let second = provider.fetch(&request("MSFT", 2, None)).await.unwrap();
        assert!(second.iter().all(|e| e.retrieval_pass == 2));
        assert!(second.iter().all(|e| !first.iter().any(|f| f.id == e.id)));
    }

    #[tokio::test]
    async fn test_pipeline_of_offline_providers_produces_causes() {
        let provider = OfflineProviders::default();
        let req = request("MSFT", 1, None);
        let events = provider.fetch(&req).await.unwrap();
        let ir = provider.extract(&req.windows, &events).await.unwrap();
        assert_eq!(ir.ticker, "MSFT");
        assert!(!ir.events.is_empty());
        assert_eq!(ir.related_tickers(), vec!["NVDA".to_string(), "GOOGL".to_string()]);

        let findings = provider.audit(&ir).await.unwrap();
        assert_eq!(findings.len(), ir.events.len() * 4);

        let judgement = provider
            .judge(&ir, &findings, &evidence(&events), Some("why did earnings move the stock"))
            .await
            .unwrap();
        assert!(!judgement.ranked_causes.is_empty());
        assert!(judgement.ranked_causes.len() <= MAX_CAUSES);
        assert_eq!(judgement.ranked_causes[0].rank, 1);
        let scores: Vec<f64> = judgement.ranked_causes.iter().map(|c| c.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(judgement.report_ir.evidence_count, events.len() as u32);
        assert_eq!(
            judgement.report_ir.checks_passed + judgement.report_ir.checks_failed,
            findings.len() as u32
        );
    }

    #[tokio::test]
    async fn test_extract_without_subject_documents_is_fatal() {
        let provider = OfflineProviders::default();
        let req = request("MSFT", 1, None);
        let err = provider.extract(&req.windows, &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_related_entity_documents_form_separate_events() {
        let provider = OfflineProviders::default();
        let req = request("AAPL", 1, None);
        let mut events = provider.fetch(&req).await.unwrap();
        events.extend(provider.fetch(&request("TSM", 2, Some("TSM"))).await.unwrap());
        let ir = provider.extract(&req.windows, &events).await.unwrap();
        assert_eq!(ir.ticker, "AAPL");
        assert!(ir.events.iter().any(|e| e.via_entity.as_deref() == Some("TSM")));
        assert!(ir.events.iter().any(|e| e.via_entity.is_none()));
    }
}
