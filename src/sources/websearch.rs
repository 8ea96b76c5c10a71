//! Web-search client used for scholar-style discovery (`google_scholar`
//! strategy). Subject to the same retry policy as every other source but
//! its own quota — it does not share PubMed's rate-limit scheduler.

use std::borrow::Cow;

use serde::Deserialize;

use crate::error::PublinkError;

const WEBSEARCH_BASE: &str = "https://api.search.brave.com/res/v1/web/search";
const WEBSEARCH_BASE_ENV: &str = "PUBLINK_WEBSEARCH_BASE";
const WEBSEARCH_API: &str = "websearch";
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct WebSearchClient {
    client: reqwest::Client,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScholarResult {
    pub title: String,
}

impl WebSearchClient {
    pub fn new() -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::streaming_http_client()?,
            base: crate::sources::env_base(WEBSEARCH_BASE, WEBSEARCH_BASE_ENV),
            api_key: std::env::var("PUBLINK_WEBSEARCH_API_KEY").ok(),
        })
    }

    #[cfg(test)]
    pub fn new_for_test(base: String) -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::streaming_http_client()?,
            base: Cow::Owned(base),
            api_key: None,
        })
    }

    /// Query the configured web-search API with a scholar-flavored query
    /// and return the result titles, which discovery strategies resolve
    /// to PMIDs by citation match or fuzzy title comparison.
    pub async fn scholar(&self, query: &str) -> Result<Vec<ScholarResult>, PublinkError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client.clone();
        let url = self.base.to_string();
        let query = query.to_string();
        let api_key = self.api_key.clone();
        let resp = crate::sources::retry_send(WEBSEARCH_API, MAX_RETRIES, || {
            let mut req = client.get(&url).query(&[("q", query.as_str())]);
            if let Some(key) = &api_key {
                req = req.header("X-Subscription-Token", key);
            }
            async move { req.send().await }
        })
        .await?;

        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, WEBSEARCH_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: WEBSEARCH_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }

        let parsed: WebSearchResponse = serde_json::from_slice(&bytes)
            .map_err(|source| PublinkError::ApiJson { api: WEBSEARCH_API.to_string(), source })?;
        Ok(parsed
            .web
            .results
            .into_iter()
            .map(|r| ScholarResult { title: r.title })
            .collect())
    }
}

#[derive(Debug, Deserialize, Default)]
struct WebSearchResponse {
    #[serde(default)]
    web: WebSearchResults,
}

#[derive(Debug, Deserialize, Default)]
struct WebSearchResults {
    #[serde(default)]
    results: Vec<WebSearchHit>,
}

#[derive(Debug, Deserialize)]
struct WebSearchHit {
    title: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn scholar_returns_empty_for_blank_query() {
        let client = WebSearchClient::new_for_test("http://example.invalid".into()).unwrap();
        let results = client.scholar("  ").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn scholar_parses_result_titles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "NCT04267848"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {"results": [{"title": "A Study of Remdesivir: results"}]}
            })))
            .mount(&server)
            .await;

        let client = WebSearchClient::new_for_test(server.uri()).unwrap();
        let results = client.scholar("NCT04267848").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "A Study of Remdesivir: results");
    }
}
