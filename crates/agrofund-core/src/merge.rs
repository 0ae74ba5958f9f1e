//! First-seen-wins merge of record batches.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FundingOpportunity;

/// Field combination that identifies "the same" opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupKey {
    Name,
    #[default]
    NameAndSource,
}

impl DedupKey {
    pub fn key_for(self, record: &FundingOpportunity) -> String {
        match self {
            DedupKey::Name => record.name.trim().to_string(),
            DedupKey::NameAndSource => {
                format!("{}\u{1f}{}", record.name.trim(), record.source.trim())
            }
        }
    }
}

impl FromStr for DedupKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(DedupKey::Name),
            "name+source" | "name_and_source" | "name-source" => Ok(DedupKey::NameAndSource),
            other => Err(format!("unknown dedup key {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: Vec<FundingOpportunity>,
    /// Incoming records that made it into `merged`.
    pub added: usize,
    /// Every dropped record, whether it came from `existing` or `incoming`.
    pub duplicates: usize,
}

pub fn merge(
    existing: &[FundingOpportunity],
    incoming: &[FundingOpportunity],
    key: DedupKey,
) -> MergeOutcome {
    merge_by(existing, incoming, |record| key.key_for(record))
}

/// Walks `existing` then `incoming`, keeping the first record seen for each key.
/// Later copies are dropped whole, never merged field by field.
pub fn merge_by<F>(
    existing: &[FundingOpportunity],
    incoming: &[FundingOpportunity],
    key_fn: F,
) -> MergeOutcome
where
    F: Fn(&FundingOpportunity) -> String,
{
    let mut seen = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut duplicates = 0usize;
    let mut added = 0usize;

    for record in existing {
        if seen.insert(key_fn(record)) {
            merged.push(record.clone());
        } else {
            duplicates += 1;
        }
    }
    for record in incoming {
        if seen.insert(key_fn(record)) {
            merged.push(record.clone());
            added += 1;
        } else {
            duplicates += 1;
        }
    }

    MergeOutcome {
        merged,
        added,
        duplicates,
    }
}
