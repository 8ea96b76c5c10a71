//! LLM service client. Exposes the synchronous completion call the live
//! driver and query-gen "live" path use, plus the four batch-surface
//! calls (`upload_file`, `create_batch`, `retrieve_batch`,
//! `download_file`) the batch orchestrator drives. No separate SDK: both
//! surfaces are plain `reqwest` calls against the provider's completion,
//! files, and batches endpoints, matching the shape of every other
//! client in this crate.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PublinkError;

const LLM_BASE: &str = "https://api.openai.com/v1";
const LLM_BASE_ENV: &str = "PUBLINK_LLM_BASE";
const LLM_API: &str = "llm";
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub parsed: Value,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled)
    }

    pub fn is_non_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Validating | BatchStatus::InProgress | BatchStatus::Finalizing
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchHandle {
    pub batch_id: String,
    pub status: BatchStatus,
    pub output_file_id: Option<String>,
}

impl LlmClient {
    pub fn new() -> Result<Self, PublinkError> {
        Ok(Self {
            client: crate::sources::streaming_http_client()?,
            base: crate::sources::env_base(LLM_BASE, LLM_BASE_ENV),
            api_key: std::env::var("PUBLINK_LLM_API_KEY").ok(),
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

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Synchronous completion: one request, schema-constrained response.
    /// Used by the live driver and by synchronous `pubmed_gpt_*` query
    /// generation.
    pub async fn complete(
        &self,
        model: &str,
        reasoning: ReasoningEffort,
        max_output_tokens: u32,
        schema: &Value,
        messages: &[Value],
    ) -> Result<CompletionResult, PublinkError> {
        let body = serde_json::json!({
            "model": model,
            "reasoning_effort": reasoning,
            "max_completion_tokens": max_output_tokens,
            "messages": messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": "structured_response", "schema": schema, "strict": true},
            },
        });

        let client = self.client.clone();
        let url = self.endpoint("chat/completions");
        let resp = crate::sources::retry_send(LLM_API, MAX_RETRIES, || {
            let req = self.authed(client.post(&url).json(&body));
            async move { req.send().await }
        })
        .await?;

        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, LLM_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: LLM_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|source| PublinkError::ApiJson { api: LLM_API.to_string(), source })?;
        extract_completion(parsed)
    }

    /// Multipart-upload a JSONL batch-request file; returns the file id
    /// the batch job is created against.
    pub async fn upload_file(&self, jsonl_bytes: Vec<u8>) -> Result<String, PublinkError> {
        let client = self.client.clone();
        let url = self.endpoint("files");
        let resp = crate::sources::retry_send(LLM_API, MAX_RETRIES, || {
            let part = reqwest::multipart::Part::bytes(jsonl_bytes.clone())
                .file_name("batch.jsonl")
                .mime_str("application/jsonl")
                .expect("static mime string is valid");
            let form = reqwest::multipart::Form::new()
                .text("purpose", "batch")
                .part("file", part);
            let req = self.authed(client.post(&url)).multipart(form);
            async move { req.send().await }
        })
        .await?;

        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, LLM_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: LLM_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        let parsed: FileUploadResponse = serde_json::from_slice(&bytes)
            .map_err(|source| PublinkError::ApiJson { api: LLM_API.to_string(), source })?;
        Ok(parsed.id)
    }

    pub async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
    ) -> Result<BatchHandle, PublinkError> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": completion_window,
        });
        let client = self.client.clone();
        let url = self.endpoint("batches");
        let resp = crate::sources::retry_send(LLM_API, MAX_RETRIES, || {
            let req = self.authed(client.post(&url).json(&body));
            async move { req.send().await }
        })
        .await?;
        self.parse_batch_response(resp).await
    }

    pub async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchHandle, PublinkError> {
        let client = self.client.clone();
        let url = self.endpoint(&format!("batches/{batch_id}"));
        let resp = crate::sources::retry_send(LLM_API, MAX_RETRIES, || {
            let req = self.authed(client.get(&url));
            async move { req.send().await }
        })
        .await?;
        self.parse_batch_response(resp).await
    }

    async fn parse_batch_response(
        &self,
        resp: reqwest::Response,
    ) -> Result<BatchHandle, PublinkError> {
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, LLM_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: LLM_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        let parsed: BatchResponse = serde_json::from_slice(&bytes)
            .map_err(|source| PublinkError::ApiJson { api: LLM_API.to_string(), source })?;
        Ok(BatchHandle {
            batch_id: parsed.id,
            status: parsed.status,
            output_file_id: parsed.output_file_id,
        })
    }

    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, PublinkError> {
        let client = self.client.clone();
        let url = self.endpoint(&format!("files/{file_id}/content"));
        let resp = crate::sources::retry_send(LLM_API, MAX_RETRIES, || {
            let req = self.authed(client.get(&url));
            async move { req.send().await }
        })
        .await?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, LLM_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PublinkError::Api {
                api: LLM_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(bytes.to_vec())
    }
}

fn extract_completion(resp: ChatCompletionResponse) -> Result<CompletionResult, PublinkError> {
    let content = resp
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .ok_or_else(|| PublinkError::Api {
            api: LLM_API.to_string(),
            message: "completion response had no message content".into(),
        })?;
    let parsed: Value = serde_json::from_str(&content)
        .map_err(|source| PublinkError::ApiJson { api: LLM_API.to_string(), source })?;
    Ok(CompletionResult {
        parsed,
        usage: Usage {
            input_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or_default(),
            output_tokens: resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or_default(),
        },
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    status: BatchStatus,
    output_file_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn complete_parses_structured_json_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"hasResults\":true,\"reason\":\"ok\"}"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new_for_test(server.uri()).unwrap();
        let result = client
            .complete(
                "gpt-test",
                ReasoningEffort::Low,
                256,
                &serde_json::json!({"type": "object"}),
                &[serde_json::json!({"role": "user", "content": "hi"})],
            )
            .await
            .unwrap();
        assert_eq!(result.parsed["hasResults"], serde_json::json!(true));
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn retrieve_batch_parses_completed_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/batches/batch_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "batch_123",
                "status": "completed",
                "output_file_id": "file_out",
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new_for_test(server.uri()).unwrap();
        let handle = client.retrieve_batch("batch_123").await.unwrap();
        assert_eq!(handle.status, BatchStatus::Completed);
        assert_eq!(handle.output_file_id.as_deref(), Some("file_out"));
    }

    #[test]
    fn batch_status_classifies_terminal_failures() {
        assert!(BatchStatus::Failed.is_terminal_failure());
        assert!(BatchStatus::Expired.is_terminal_failure());
        assert!(BatchStatus::Cancelled.is_terminal_failure());
        assert!(!BatchStatus::Completed.is_terminal_failure());
        assert!(BatchStatus::InProgress.is_non_terminal());
        assert!(!BatchStatus::Completed.is_non_terminal());
    }
}
