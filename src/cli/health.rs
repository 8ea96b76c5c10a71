//! Connectivity check against every external dependency this crate
//! talks to: the three registries, PubMed, the web-search API, and the
//! LLM provider. Reuses the teacher's `HealthReport`/`HealthRow`
//! Markdown-table shape so `publink health` and `biomcp health` read
//! the same way to an operator.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::PublinkError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRow {
    pub api: String,
    pub status: String,
    pub latency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affects: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub total: usize,
    pub rows: Vec<HealthRow>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let show_affects = self.rows.iter().any(|row| row.affects.is_some());
        out.push_str("# publink Health Check\n\n");
        if show_affects {
            out.push_str("| API | Status | Latency | Affects |\n");
            out.push_str("|-----|--------|---------|---------|\n");
            for row in &self.rows {
                let affects = row.affects.as_deref().unwrap_or("-");
                out.push_str(&format!("| {} | {} | {} | {} |\n", row.api, row.status, row.latency, affects));
            }
        } else {
            out.push_str("| API | Status | Latency |\n");
            out.push_str("|-----|--------|---------|\n");
            for row in &self.rows {
                out.push_str(&format!("| {} | {} | {} |\n", row.api, row.status, row.latency));
            }
        }
        out.push_str(&format!("\nStatus: {}/{} dependencies healthy\n", self.healthy, self.total));
        out
    }
}

fn affects_for_api(api: &str) -> Option<&'static str> {
    match api {
        "CTgov" => Some("ctgov registration lookups"),
        "EUCTR" => Some("euctr registration lookups"),
        "DRKS" => Some("drks registration lookups"),
        "PubMed" => Some("discovery strategies and enrichment"),
        "Web Search" => Some("google_scholar strategy"),
        "LLM" => Some("pubmed_gpt_v1/v2 strategies and classification"),
        _ => None,
    }
}

async fn check_one(client: reqwest::Client, api: &str, url: &str) -> HealthRow {
    let start = Instant::now();
    let resp = client.get(url).header(reqwest::header::ACCEPT, "application/json").send().await;

    match resp {
        Ok(resp) => {
            let status = resp.status();
            let elapsed = start.elapsed().as_millis();
            if status.is_success() {
                HealthRow { api: api.to_string(), status: "ok".into(), latency: format!("{elapsed}ms"), affects: None }
            } else {
                HealthRow {
                    api: api.to_string(),
                    status: "error".into(),
                    latency: format!("{elapsed}ms (HTTP {})", status.as_u16()),
                    affects: affects_for_api(api).map(str::to_string),
                }
            }
        }
        Err(err) => {
            let reason = if err.is_timeout() {
                "timeout"
            } else if err.is_connect() {
                "connect"
            } else {
                "error"
            };
            HealthRow { api: api.to_string(), status: "error".into(), latency: reason.into(), affects: affects_for_api(api).map(str::to_string) }
        }
    }
}

fn health_http_client() -> Result<reqwest::Client, PublinkError> {
    static HEALTH_HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    if let Some(client) = HEALTH_HTTP_CLIENT.get() {
        return Ok(client.clone());
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("publink/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(PublinkError::from)?;

    match HEALTH_HTTP_CLIENT.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => HEALTH_HTTP_CLIENT.get().cloned().ok_or_else(|| PublinkError::Api {
            api: "health".into(),
            message: "health HTTP client initialization race".into(),
        }),
    }
}

async fn check_cache_dir() -> HealthRow {
    let start = Instant::now();
    let dir = dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("publink").join("http");
    let suffix = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos();
    let probe = dir.join(format!(".publink-healthcheck-{suffix}.tmp"));

    let result = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&probe, b"ok").await?;
        match tokio::fs::remove_file(&probe).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
    .await;

    match result {
        Ok(()) => HealthRow {
            api: format!("Cache dir ({})", dir.display()),
            status: "ok".into(),
            latency: format!("{}ms", start.elapsed().as_millis()),
            affects: None,
        },
        Err(err) => HealthRow {
            api: format!("Cache dir ({})", dir.display()),
            status: "error".into(),
            latency: format!("{:?}", err.kind()),
            affects: Some("HTTP response caching for every source".into()),
        },
    }
}

/// Ping every external dependency and, unless `apis_only`, the local
/// HTTP cache directory.
///
/// # Errors
///
/// Returns an error when the shared health HTTP client cannot be built.
pub async fn check(apis_only: bool) -> Result<HealthReport, PublinkError> {
    let client = health_http_client()?;

    let ctgov_base = crate::sources::env_base("https://clinicaltrials.gov/api/v2", "PUBLINK_CTGOV_BASE");
    let euctr_base = crate::sources::env_base("https://www.clinicaltrialsregister.eu", "PUBLINK_EUCTR_BASE");
    let drks_base = crate::sources::env_base("https://www.drks.de", "PUBLINK_DRKS_BASE");
    let llm_base = crate::sources::env_base("https://api.openai.com/v1", "PUBLINK_LLM_BASE");
    let websearch_base = crate::sources::env_base("https://api.search.brave.com/res/v1/web/search", "PUBLINK_WEBSEARCH_BASE");

    let (ctgov, euctr, drks, pubmed, websearch, llm) = tokio::join!(
        check_one(client.clone(), "CTgov", &format!("{ctgov_base}/studies?query.term=cancer&pageSize=1")),
        check_one(client.clone(), "EUCTR", &euctr_base),
        check_one(client.clone(), "DRKS", &drks_base),
        check_one(client.clone(), "PubMed", "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi?db=pubmed&term=cancer&retmax=1"),
        check_one(client.clone(), "Web Search", &websearch_base),
        check_one(client.clone(), "LLM", &format!("{llm_base}/models")),
    );

    let mut rows = vec![ctgov, euctr, drks, pubmed, websearch, llm];
    if !apis_only {
        rows.push(check_cache_dir().await);
    }
    let healthy = rows.iter().filter(|r| r.status == "ok").count();
    Ok(HealthReport { healthy, total: rows.len(), rows })
}

#[cfg(test)]
mod tests {
    use super::{HealthReport, HealthRow};

    #[test]
    fn markdown_shows_affects_column_when_present() {
        let report = HealthReport {
            healthy: 1,
            total: 2,
            rows: vec![
                HealthRow { api: "PubMed".into(), status: "ok".into(), latency: "10ms".into(), affects: None },
                HealthRow {
                    api: "LLM".into(),
                    status: "error".into(),
                    latency: "timeout".into(),
                    affects: Some("pubmed_gpt_v1/v2 strategies and classification".into()),
                },
            ],
        };
        let md = report.to_markdown();
        assert!(md.contains("| API | Status | Latency | Affects |"));
        assert!(md.contains("classification"));
    }

    #[test]
    fn markdown_omits_affects_column_when_all_healthy() {
        let report = HealthReport {
            healthy: 2,
            total: 2,
            rows: vec![
                HealthRow { api: "PubMed".into(), status: "ok".into(), latency: "10ms".into(), affects: None },
                HealthRow { api: "LLM".into(), status: "ok".into(), latency: "11ms".into(), affects: None },
            ],
        };
        let md = report.to_markdown();
        assert!(md.contains("| API | Status | Latency |"));
        assert!(!md.contains("Affects"));
    }

    #[test]
    fn all_healthy_reports_true_only_when_every_row_is_ok() {
        let report = HealthReport {
            healthy: 1,
            total: 2,
            rows: vec![
                HealthRow { api: "PubMed".into(), status: "ok".into(), latency: "10ms".into(), affects: None },
                HealthRow { api: "LLM".into(), status: "error".into(), latency: "timeout".into(), affects: None },
            ],
        };
        assert!(!report.all_healthy());
    }
}
