//! Discovery strategies: pluggable producers of candidate PMIDs from a
//! registration. Each strategy implements [`Strategy`], runs
//! concurrently with the others for a given registration, and is
//! expected to fail in isolation — a strategy error is captured as a
//! `{fn, message}` pair and never aborts its siblings.

pub mod enrich;
pub mod filters;
pub mod fuzzy;
pub mod strategies;

use std::sync::Arc;

use futures::future::join_all;

use crate::config::Config;
use crate::model::{StrategyOutcome, UnitError};
use crate::registry::Registration;
use crate::sources::llm::LlmClient;
use crate::sources::pubmed::PubmedClient;
use crate::sources::websearch::WebSearchClient;

pub const PUBMED_SEARCH_LIMIT: usize = 5;

/// Shared, process-wide context every strategy invocation borrows:
/// client handles and the prepared-query pool directories batch mode
/// reads from instead of calling the LLM live. Passed explicitly per
/// the crate's "no hidden globals beyond the PubMed scheduler" rule.
#[derive(Clone)]
pub struct DiscoveryContext {
    pub pubmed: Arc<PubmedClient>,
    pub websearch: Arc<WebSearchClient>,
    pub llm: Arc<LlmClient>,
    pub config: Arc<Config>,
    /// Set only in batch mode, where `pubmed_gpt_v1`/`v2` read a
    /// pre-materialized query bundle instead of calling the LLM live.
    pub query_pool_v1_dir: Option<std::path::PathBuf>,
    pub query_pool_v2_dir: Option<std::path::PathBuf>,
}

#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &'static str;
    async fn run(&self, registration: &Registration, ctx: &DiscoveryContext) -> StrategyOutcome;
}

/// Build the enabled strategy set from config, in the stable order
/// `ALL_STRATEGY_IDS` lists them.
pub fn enabled_strategies(config: &Config) -> Vec<Box<dyn Strategy>> {
    let mut enabled: Vec<Box<dyn Strategy>> = Vec::new();
    for id in crate::model::ALL_STRATEGY_IDS {
        if !config.strategies.iter().any(|s| s == id) {
            continue;
        }
        enabled.push(strategies::build(id));
    }
    enabled
}

/// Run every enabled strategy concurrently for one registration. Returns
/// the per-strategy candidate lists (for dedup/fusion) and the captured
/// per-strategy errors (for `failed_publication_discoveries`).
pub async fn run_all(
    registration: &Registration,
    ctx: &DiscoveryContext,
    strategies: &[Box<dyn Strategy>],
) -> (Vec<(String, Vec<crate::model::Candidate>)>, Vec<UnitError>) {
    let futures = strategies.iter().map(|strategy| async move {
        let outcome = strategy.run(registration, ctx).await;
        (strategy.id(), outcome)
    });
    let results = join_all(futures).await;

    let mut per_strategy = Vec::new();
    let mut errors = Vec::new();
    for (id, outcome) in results {
        if let Some(message) = outcome.error {
            errors.push(UnitError { fn_name: id.to_string(), message });
        }
        per_strategy.push((id.to_string(), outcome.results));
    }
    (per_strategy, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_strategies_respects_config_subset() {
        let mut config = Config::default();
        config.strategies = vec![crate::model::STRATEGY_LINKED_AT_REGISTRATION.to_string()];
        let strategies = enabled_strategies(&config);
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].id(), crate::model::STRATEGY_LINKED_AT_REGISTRATION);
    }

    #[test]
    fn zero_strategies_enabled_yields_empty_set() {
        let mut config = Config::default();
        config.strategies = Vec::new();
        assert!(enabled_strategies(&config).is_empty());
    }
}
