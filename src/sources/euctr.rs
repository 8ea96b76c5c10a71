//! EU Clinical Trials Register HTTP client. The registry exposes no JSON
//! API: a plain-text protocol dump and a separate HTML results page, both
//! fetched in parallel by the adapter and handed to this client one at a
//! time, matching the shape of every other source client in this crate.

use std::borrow::Cow;

use crate::error::PublinkError;

const EUCTR_BASE: &str = "https://www.clinicaltrialsregister.eu/ctr-search";
const EUCTR_BASE_ENV: &str = "PUBLINK_EUCTR_BASE";
const EUCTR_API: &str = "euctr";

#[derive(Clone)]
pub struct EuctrClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

impl EuctrClient {
    pub fn new() -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(EUCTR_BASE, EUCTR_BASE_ENV),
        })
    }

    #[cfg(test)]
    pub fn new_for_test(base: String) -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
        })
    }

    pub async fn fetch_protocol_text(&self, trial_id: &str) -> Result<String, PublinkError> {
        self.fetch_text(&format!("{}/trial/{}/DE", self.base.trim_end_matches('/'), trial_id))
            .await
    }

    pub async fn fetch_results_html(&self, trial_id: &str) -> Result<String, PublinkError> {
        self.fetch_text(&format!(
            "{}/trial/{}/results",
            self.base.trim_end_matches('/'),
            trial_id
        ))
        .await
    }

    async fn fetch_text(&self, url: &str) -> Result<String, PublinkError> {
        let req = self.client.get(url);
        let resp = crate::sources::apply_cache_mode(req).send().await?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, EUCTR_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: EUCTR_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
