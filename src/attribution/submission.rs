use std::sync::LazyLock;

use eventsense_common::{AttributionOptions, RunParams};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::calendar;
use crate::errors::ValidationError;

static TICKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9.\-]{0,9}$").expect("ticker pattern is valid"));

/// Raw submission as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub ticker: String,
    /// YYYY-MM-DD (US/Eastern)
    pub selected_day_et: String,
    #[serde(default)]
    pub nl_query: Option<String>,
    #[serde(default)]
    pub options: AttributionOptions,
}

impl SubmitRequest {
    pub fn new(ticker: impl Into<String>, selected_day_et: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            selected_day_et: selected_day_et.into(),
            nl_query: None,
            options: AttributionOptions::default(),
        }
    }

    pub fn with_query(mut self, nl_query: impl Into<String>) -> Self {
        self.nl_query = Some(nl_query.into());
        self
    }

    pub fn with_options(mut self, options: AttributionOptions) -> Self {
        self.options = options;
        self
    }

    /// Normalize and validate into run parameters.
    pub fn validate(&self) -> Result<RunParams, ValidationError> {
        let ticker = normalize_ticker(&self.ticker)?;
        let selected_day_et = calendar::parse_selected_day(&self.selected_day_et)?;
        let nl_query = self
            .nl_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        Ok(RunParams {
            ticker,
            selected_day_et,
            nl_query,
            options: self.options,
        })
    }
}

pub fn normalize_ticker(raw: &str) -> Result<String, ValidationError> {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(ValidationError::EmptyTicker);
    }
    if !TICKER_RE.is_match(&ticker) {
        return Err(ValidationError::InvalidTicker(raw.to_string()));
    }
    Ok(ticker)
}
