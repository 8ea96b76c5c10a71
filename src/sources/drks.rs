//! DRKS (German Clinical Trials Register) HTTP client. DRKS has no JSON
//! API; the adapter parses the rendered HTML trial page directly, so
//! this client is a thin fetch-and-return-HTML wrapper, mirroring the
//! shape of every other source client in this crate.

use std::borrow::Cow;

use crate::error::PublinkError;

const DRKS_BASE: &str = "https://drks.de/search/en/trial";
const DRKS_BASE_ENV: &str = "PUBLINK_DRKS_BASE";
const DRKS_API: &str = "drks";

#[derive(Clone)]
pub struct DrksClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

impl DrksClient {
    pub fn new() -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(DRKS_BASE, DRKS_BASE_ENV),
        })
    }

    #[cfg(test)]
    pub fn new_for_test(base: String) -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
        })
    }

    pub async fn fetch_html(&self, trial_id: &str) -> Result<String, PublinkError> {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), trial_id);
        let req = self.client.get(&url);
        let resp = crate::sources::apply_cache_mode(req).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PublinkError::NotFound {
                entity: "trial".into(),
                id: trial_id.to_string(),
                suggestion: None,
            });
        }

        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, DRKS_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: DRKS_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
