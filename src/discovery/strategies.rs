//! The five discovery strategies. Each owns only its IO; the engine in
//! `discovery::mod` owns concurrency and error capture.

use serde::{Deserialize, Serialize};

use crate::discovery::{DiscoveryContext, PUBMED_SEARCH_LIMIT, Strategy};
use crate::model::{self, Candidate, StrategyOutcome};
use crate::registry::Registration;

pub fn build(id: &str) -> Box<dyn Strategy> {
    match id {
        model::STRATEGY_LINKED_AT_REGISTRATION => Box::new(LinkedAtRegistration),
        model::STRATEGY_PUBMED_NAIVE => Box::new(PubmedNaive),
        model::STRATEGY_GOOGLE_SCHOLAR => Box::new(GoogleScholar),
        model::STRATEGY_PUBMED_GPT_V1 => Box::new(PubmedGptV1),
        model::STRATEGY_PUBMED_GPT_V2 => Box::new(PubmedGptV2),
        other => panic!("unknown strategy id: {other}"),
    }
}

fn ok(pmids: impl IntoIterator<Item = String>) -> StrategyOutcome {
    StrategyOutcome {
        results: pmids.into_iter().map(|pmid| Candidate { pmid, publication_date: None }).collect(),
        error: None,
    }
}

fn failed(message: impl Into<String>) -> StrategyOutcome {
    StrategyOutcome { results: Vec::new(), error: Some(message.into()) }
}

/// `linked_at_registration`: registry-provided PMIDs, preferring a
/// results-page scrape (`linked_pubmed_ids`) over CTGov `references`.
pub struct LinkedAtRegistration;

#[async_trait::async_trait]
impl Strategy for LinkedAtRegistration {
    fn id(&self) -> &'static str {
        model::STRATEGY_LINKED_AT_REGISTRATION
    }

    async fn run(&self, registration: &Registration, _ctx: &DiscoveryContext) -> StrategyOutcome {
        ok(registration.known_pmids())
    }
}

fn naive_query(registration: &Registration) -> String {
    let mut terms = vec![registration.trial_id.clone()];
    if let Some(title) = &registration.brief_title {
        terms.push(title.clone());
    }
    if let Some(investigator) = &registration.investigator_full_name {
        terms.push(investigator.clone());
    }
    let mut query = terms.join(" AND ");
    if let Some(start) = &registration.start_date {
        query.push_str(&format!(" AND {start}[PDAT] : 3000[PDAT]"));
    }
    query
}

/// `pubmed_naive`: a structured PubMed query from trial id, brief title,
/// and investigator name, constrained to `publicationDate >= startDate`.
pub struct PubmedNaive;

#[async_trait::async_trait]
impl Strategy for PubmedNaive {
    fn id(&self) -> &'static str {
        model::STRATEGY_PUBMED_NAIVE
    }

    async fn run(&self, registration: &Registration, ctx: &DiscoveryContext) -> StrategyOutcome {
        let query = naive_query(registration);
        match ctx.pubmed.search(&query, PUBMED_SEARCH_LIMIT).await {
            Ok(papers) => ok(papers.into_iter().map(|p| p.pmid)),
            Err(err) => failed(err.to_string()),
        }
    }
}

/// `google_scholar`: web-search the trial id, resolve each returned
/// title to a PMID via citation-match, then fall back to fuzzy title
/// matching against the top-100 PubMed title search.
pub struct GoogleScholar;

#[async_trait::async_trait]
impl Strategy for GoogleScholar {
    fn id(&self) -> &'static str {
        model::STRATEGY_GOOGLE_SCHOLAR
    }

    async fn run(&self, registration: &Registration, ctx: &DiscoveryContext) -> StrategyOutcome {
        let hits = match ctx.websearch.scholar(&registration.trial_id).await {
            Ok(hits) => hits,
            Err(err) => return failed(err.to_string()),
        };
        if hits.is_empty() {
            return ok(Vec::new());
        }

        let top_titles = match ctx.pubmed.search(&registration.trial_id, 100).await {
            Ok(papers) => papers,
            Err(_) => Vec::new(),
        };

        let mut pmids = std::collections::BTreeSet::new();
        for hit in &hits {
            match ctx.pubmed.citation_match(&hit.title).await {
                Ok(matches) if !matches.is_empty() => {
                    pmids.extend(matches);
                    continue;
                }
                Err(err) => return failed(err.to_string()),
                _ => {}
            }
            let candidates: Vec<(&str, &str)> =
                top_titles.iter().map(|p| (p.title.as_str(), p.pmid.as_str())).collect();
            if let Some((pmid, _)) = crate::discovery::fuzzy::best_match(&hit.title, candidates, 0.5) {
                pmids.insert(pmid.to_string());
            }
        }
        ok(pmids)
    }
}

fn registration_user_prompt(registration: &Registration) -> String {
    serde_json::json!({
        "trialId": registration.trial_id,
        "briefTitle": registration.brief_title,
        "officialTitle": registration.official_title,
        "briefSummary": registration.brief_summary,
        "conditions": registration.conditions,
        "interventions": registration.interventions,
        "investigatorFullName": registration.investigator_full_name,
    })
    .to_string()
}

#[derive(Debug, Deserialize, Serialize)]
struct QueryV1Response {
    query: String,
}

fn query_v1_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {"query": {"type": "string"}},
        "required": ["query"],
    })
}

/// `pubmed_gpt_v1`: ask the LLM for one PubMed query, then run it. In
/// batch mode the query is read from the pre-materialized pool instead
/// of calling the LLM synchronously.
pub struct PubmedGptV1;

#[async_trait::async_trait]
impl Strategy for PubmedGptV1 {
    fn id(&self) -> &'static str {
        model::STRATEGY_PUBMED_GPT_V1
    }

    async fn run(&self, registration: &Registration, ctx: &DiscoveryContext) -> StrategyOutcome {
        let query = if let Some(dir) = &ctx.query_pool_v1_dir {
            match read_pooled::<QueryV1Response>(dir, &registration.trial_id).await {
                Ok(Some(q)) => q.query,
                Ok(None) => return failed("no prepared pubmed_gpt_v1 query for this trial"),
                Err(message) => return failed(message),
            }
        } else {
            let system = system_prompt(&ctx.config.system_prompts.query_v1);
            let messages = vec![
                serde_json::json!({"role": "system", "content": system}),
                serde_json::json!({"role": "user", "content": registration_user_prompt(registration)}),
            ];
            match ctx
                .llm
                .complete(
                    &ctx.config.models.query_v1,
                    ctx.config.reasoning.query_v1,
                    ctx.config.max_tokens_query_v1,
                    &query_v1_schema(),
                    &messages,
                )
                .await
            {
                Ok(result) => match serde_json::from_value::<QueryV1Response>(result.parsed) {
                    Ok(parsed) => parsed.query,
                    Err(err) => return failed(err.to_string()),
                },
                Err(err) => return failed(err.to_string()),
            }
        };

        match ctx.pubmed.search(&query, PUBMED_SEARCH_LIMIT).await {
            Ok(papers) => ok(papers.into_iter().map(|p| p.pmid)),
            Err(err) => failed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct QueryV2Bundle {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub investigators: Vec<String>,
    #[serde(default)]
    pub search_strings: Vec<String>,
    #[serde(default)]
    pub extra_queries: Vec<String>,
}

impl QueryV2Bundle {
    fn queries(&self) -> Vec<String> {
        let mut all = Vec::new();
        all.extend(self.search_strings.iter().take(6).cloned());
        all.extend(self.extra_queries.iter().take(3).cloned());
        all
    }
}

fn query_v2_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "keywords": {"type": "array", "items": {"type": "string"}, "maxItems": 4},
            "investigators": {"type": "array", "items": {"type": "string"}, "maxItems": 3},
            "search_strings": {"type": "array", "items": {"type": "string"}, "maxItems": 6},
            "extra_queries": {"type": "array", "items": {"type": "string"}, "maxItems": 3},
        },
        "required": ["keywords", "investigators", "search_strings", "extra_queries"],
    })
}

/// `pubmed_gpt_v2`: ask the LLM for a bundle of queries, run each on
/// PubMed, and union the results.
pub struct PubmedGptV2;

#[async_trait::async_trait]
impl Strategy for PubmedGptV2 {
    fn id(&self) -> &'static str {
        model::STRATEGY_PUBMED_GPT_V2
    }

    async fn run(&self, registration: &Registration, ctx: &DiscoveryContext) -> StrategyOutcome {
        let bundle = if let Some(dir) = &ctx.query_pool_v2_dir {
            match read_pooled::<QueryV2Bundle>(dir, &registration.trial_id).await {
                Ok(Some(bundle)) => bundle,
                Ok(None) => return failed("no prepared pubmed_gpt_v2 query bundle for this trial"),
                Err(message) => return failed(message),
            }
        } else {
            let system = system_prompt(&ctx.config.system_prompts.query_v2);
            let messages = vec![
                serde_json::json!({"role": "system", "content": system}),
                serde_json::json!({"role": "user", "content": registration_user_prompt(registration)}),
            ];
            match ctx
                .llm
                .complete(
                    &ctx.config.models.query_v2,
                    ctx.config.reasoning.query_v2,
                    ctx.config.max_tokens_query_v2,
                    &query_v2_schema(),
                    &messages,
                )
                .await
            {
                Ok(result) => match serde_json::from_value::<QueryV2Bundle>(result.parsed) {
                    Ok(parsed) => parsed,
                    Err(err) => return failed(err.to_string()),
                },
                Err(err) => return failed(err.to_string()),
            }
        };

        let mut pmids = std::collections::BTreeSet::new();
        for query in bundle.queries() {
            match ctx.pubmed.search(&query, PUBMED_SEARCH_LIMIT).await {
                Ok(papers) => pmids.extend(papers.into_iter().map(|p| p.pmid)),
                Err(err) => return failed(err.to_string()),
            }
        }
        ok(pmids)
    }
}

fn system_prompt(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

async fn read_pooled<T: serde::de::DeserializeOwned>(
    dir: &std::path::Path,
    trial_id: &str,
) -> Result<Option<T>, String> {
    let path = dir.join(format!("{trial_id}.json"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| e.to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_query_combines_trial_id_title_and_investigator() {
        let registration = Registration {
            trial_id: "NCT04267848".into(),
            brief_title: Some("A Study of Remdesivir".into()),
            investigator_full_name: Some("Jane Doe".into()),
            start_date: Some("2020-02-05".into()),
            ..Default::default()
        };
        let query = naive_query(&registration);
        assert!(query.contains("NCT04267848"));
        assert!(query.contains("A Study of Remdesivir"));
        assert!(query.contains("Jane Doe"));
        assert!(query.contains("2020-02-05[PDAT]"));
    }

    #[test]
    fn query_v2_bundle_caps_and_combines_query_sources() {
        let bundle = QueryV2Bundle {
            search_strings: vec!["a".into(), "b".into()],
            extra_queries: vec!["c".into()],
            ..Default::default()
        };
        assert_eq!(bundle.queries(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn linked_at_registration_reads_known_pmids() {
        let registration = Registration {
            trial_id: "NCT04267848".into(),
            linked_pubmed_ids: vec!["555".into(), "666".into()],
            ..Default::default()
        };
        let ctx = DiscoveryContext {
            pubmed: std::sync::Arc::new(crate::sources::pubmed::PubmedClient::new_for_test("http://x".into()).unwrap()),
            websearch: std::sync::Arc::new(crate::sources::websearch::WebSearchClient::new_for_test("http://x".into()).unwrap()),
            llm: std::sync::Arc::new(crate::sources::llm::LlmClient::new_for_test("http://x".into()).unwrap()),
            config: std::sync::Arc::new(crate::config::Config::default()),
            query_pool_v1_dir: None,
            query_pool_v2_dir: None,
        };
        let outcome = LinkedAtRegistration.run(&registration, &ctx).await;
        let pmids: Vec<String> = outcome.results.into_iter().map(|c| c.pmid).collect();
        assert_eq!(pmids, vec!["555".to_string(), "666".to_string()]);
    }
}
