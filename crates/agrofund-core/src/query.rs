//! Filtering, sorting and aggregate views over a loaded catalog.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::{FundingOpportunity, Status};

const FUZZY_NAME_THRESHOLD: f64 = 0.88;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Catalog order (first-seen order from the last merge).
    #[default]
    Catalog,
    AmountDesc,
    AmountAsc,
    Closing,
    Name,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "catalog" => Ok(SortOrder::Catalog),
            "amount_desc" | "amount" => Ok(SortOrder::AmountDesc),
            "amount_asc" => Ok(SortOrder::AmountAsc),
            "closing" => Ok(SortOrder::Closing),
            "name" => Ok(SortOrder::Name),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogQuery {
    pub status: Option<Status>,
    pub source: Option<String>,
    pub area: Option<String>,
    pub text: Option<String>,
    pub sort: SortOrder,
}

impl CatalogQuery {
    pub fn matches(&self, record: &FundingOpportunity) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if let Some(source) = non_blank(&self.source) {
            if !record.source.eq_ignore_ascii_case(source) {
                return false;
            }
        }
        if let Some(area) = non_blank(&self.area) {
            if !record.area_of_interest.to_lowercase().contains(&area.to_lowercase()) {
                return false;
            }
        }
        match non_blank(&self.text) {
            Some(text) => text_matches(record, text),
            None => true,
        }
    }

    pub fn apply(&self, records: &[FundingOpportunity]) -> Vec<FundingOpportunity> {
        let mut out: Vec<_> = records.iter().filter(|r| self.matches(r)).cloned().collect();
        match self.sort {
            SortOrder::Catalog => {}
            SortOrder::AmountDesc => {
                out.sort_by(|a, b| b.amount_value().total_cmp(&a.amount_value()));
            }
            SortOrder::AmountAsc => {
                out.sort_by(|a, b| a.amount_value().total_cmp(&b.amount_value()));
            }
            SortOrder::Closing => out.sort_by(|a, b| {
                match (a.closing_date_parsed(), b.closing_date_parsed()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }),
            SortOrder::Name => out.sort_by_key(|r| r.name.to_lowercase()),
        }
        out
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn text_matches(record: &FundingOpportunity, text: &str) -> bool {
    let needle = text.to_lowercase();
    let name = record.name.to_lowercase();
    [&name, &record.description.to_lowercase(), &record.area_of_interest.to_lowercase(), &record.keywords.to_lowercase()]
        .iter()
        .any(|haystack| haystack.contains(&needle))
        || jaro_winkler(&name, &needle) >= FUZZY_NAME_THRESHOLD
}

/// Aggregate counts shown on the statistics view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total: usize,
    pub open: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub by_area: BTreeMap<String, usize>,
    pub total_amount: f64,
}

impl CatalogStats {
    pub fn from_records(records: &[FundingOpportunity]) -> Self {
        let mut stats = CatalogStats {
            total: records.len(),
            ..Default::default()
        };
        for status in Status::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for record in records {
            if record.status == Status::Open {
                stats.open += 1;
            }
            *stats.by_status.entry(record.status.as_str().to_string()).or_default() += 1;
            *stats.by_source.entry(record.source.clone()).or_default() += 1;
            *stats.by_area.entry(record.area_of_interest.clone()).or_default() += 1;
            stats.total_amount += record.amount_value();
        }
        stats
    }
}
