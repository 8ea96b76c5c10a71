//! Domain types shared across discovery, enrichment, and classification:
//! the strategy identifier, the `Publication` record strategies and the
//! enricher build up together, and the `Classification` verdict the LLM
//! produces for one (trial, publication) pair.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Stable identifier of a discovery strategy, used both as a `sources`
/// tag on publications and as the `batch.strategies[]` config key.
pub type StrategyId = String;

pub const STRATEGY_LINKED_AT_REGISTRATION: &str = "linked_at_registration";
pub const STRATEGY_PUBMED_NAIVE: &str = "pubmed_naive";
pub const STRATEGY_GOOGLE_SCHOLAR: &str = "google_scholar";
pub const STRATEGY_PUBMED_GPT_V1: &str = "pubmed_gpt_v1";
pub const STRATEGY_PUBMED_GPT_V2: &str = "pubmed_gpt_v2";

pub const ALL_STRATEGY_IDS: &[&str] = &[
    STRATEGY_LINKED_AT_REGISTRATION,
    STRATEGY_PUBMED_NAIVE,
    STRATEGY_GOOGLE_SCHOLAR,
    STRATEGY_PUBMED_GPT_V1,
    STRATEGY_PUBMED_GPT_V2,
];

/// A candidate PMID a single strategy produced, before enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub pmid: String,
    pub publication_date: Option<String>,
}

/// One strategy's outcome: either a (possibly empty) list of candidates,
/// or a captured failure that does not abort the other strategies.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub results: Vec<Candidate>,
    pub error: Option<String>,
}

/// A publication candidate, enriched with PubMed metadata once available.
/// `sources` is the set-union of every strategy that produced this PMID;
/// invariant: `sources` is never empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Publication {
    pub pmid: String,
    pub doi: Option<String>,
    pub title: Option<String>,
    pub authors: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub publication_date: Option<String>,
    pub sources: BTreeSet<StrategyId>,
    #[serde(default)]
    pub nct_ids: Vec<String>,
}

impl Publication {
    pub fn new(pmid: impl Into<String>, source: impl Into<StrategyId>) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source.into());
        Self {
            pmid: pmid.into(),
            sources,
            ..Default::default()
        }
    }
}

/// One (trial, PMID) LLM verdict, including token-usage accounting for
/// the cost-calculation stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    pub has_results: bool,
    pub reason: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// An error captured for one unit of work (a strategy invocation, a
/// row) that does not abort the surrounding stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitError {
    pub fn_name: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_new_seeds_a_single_source() {
        let pub1 = Publication::new("111", STRATEGY_PUBMED_NAIVE);
        assert_eq!(pub1.sources.len(), 1);
        assert!(pub1.sources.contains(STRATEGY_PUBMED_NAIVE));
    }
}
