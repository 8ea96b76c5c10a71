//! The classifier: builds a (Registration, Publication) prompt pair and
//! turns an LLM response into a `Classification`. The synchronous and
//! batch paths share the same prompt assembly and response validator;
//! they differ only in how the request reaches the model.

use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::PublinkError;
use crate::model::{Classification, Publication};
use crate::registry::Registration;
use crate::sources::llm::LlmClient;

const SYSTEM_PROMPT_FALLBACK: &str =
    "Decide whether the candidate publication reports results for the registered trial.";

fn response_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "has_results": {"type": "boolean"},
            "reason": {"type": "string"},
        },
        "required": ["has_results", "reason"],
    })
}

fn system_prompt(config: &Config) -> String {
    std::fs::read_to_string(&config.system_prompts.results).unwrap_or_else(|_| SYSTEM_PROMPT_FALLBACK.to_string())
}

/// The user-facing half of the prompt: everything the model needs to
/// judge one (registration, publication) pair.
fn user_prompt(registration: &Registration, publication: &Publication) -> String {
    serde_json::json!({
        "trialId": registration.trial_id,
        "briefTitle": registration.brief_title,
        "officialTitle": registration.official_title,
        "studyType": registration.study_type,
        "briefSummary": registration.brief_summary,
        "detailedDescription": registration.detailed_description,
        "publication": {
            "pmid": publication.pmid,
            "title": publication.title,
            "authors": publication.authors,
            "abstract": publication.abstract_text,
            "publicationDate": publication.publication_date,
            "nctIds": publication.nct_ids,
        },
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    has_results: bool,
    reason: String,
}

/// Parse a model's raw structured-output JSON value into a `Classification`,
/// shared by the synchronous and batch paths. A malformed payload always
/// resolves to `has_results=false`, `success=false`, with the parse error
/// recorded rather than propagated.
fn parse_verdict(parsed: Value, input_tokens: u64, output_tokens: u64) -> Classification {
    match serde_json::from_value::<RawVerdict>(parsed) {
        Ok(verdict) => Classification {
            has_results: verdict.has_results,
            reason: verdict.reason,
            input_tokens,
            output_tokens,
            success: true,
            error: None,
        },
        Err(err) => Classification {
            has_results: false,
            reason: String::new(),
            input_tokens,
            output_tokens,
            success: false,
            error: Some(err.to_string()),
        },
    }
}

/// Synchronous classification: one LLM request per pair, used by the
/// live driver.
pub async fn classify(
    client: &LlmClient,
    config: &Config,
    registration: &Registration,
    publication: &Publication,
) -> Classification {
    let system = system_prompt(config);
    let messages = vec![
        serde_json::json!({"role": "system", "content": system}),
        serde_json::json!({"role": "user", "content": user_prompt(registration, publication)}),
    ];
    match client
        .complete(
            &config.models.results,
            config.reasoning.results,
            config.max_tokens_results,
            &response_schema(),
            &messages,
        )
        .await
    {
        Ok(result) => parse_verdict(result.parsed, result.usage.input_tokens, result.usage.output_tokens),
        Err(err) => Classification {
            has_results: false,
            reason: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            success: false,
            error: Some(err.to_string()),
        },
    }
}

/// A request queued for the batch `/chat/completions` endpoint,
/// identified by `custom_id = "{trialId}__{pmid}"` so the result can be
/// matched back after the batch job completes.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub custom_id: String,
    pub body: Value,
    pub estimated_tokens: u64,
}

/// System-prompt tokens every request pays regardless of the pair's own
/// content, used for the chunk's `estimatedTokens` accounting.
const SYSTEM_TOKENS_PER_REQUEST: u64 = 64;

/// Build one batch request for a (trialId, publication) pair. Estimated
/// tokens is `ceil((|system| + |user|) / 4) + SYSTEM_TOKENS_PER_REQUEST`,
/// a crude but stable proxy used only for daily-budget bookkeeping.
pub fn build_batch_request(
    config: &Config,
    registration: &Registration,
    publication: &Publication,
) -> BatchRequest {
    let system = system_prompt(config);
    let user = user_prompt(registration, publication);
    let estimated_tokens =
        ((system.len() + user.len()) as u64).div_ceil(4) + SYSTEM_TOKENS_PER_REQUEST;

    let body = serde_json::json!({
        "model": config.models.results,
        "reasoning_effort": config.reasoning.results,
        "max_completion_tokens": config.max_tokens_results,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {"name": "structured_response", "schema": response_schema(), "strict": true},
        },
    });

    BatchRequest {
        custom_id: format!("{}__{}", registration.trial_id, publication.pmid),
        body,
        estimated_tokens,
    }
}

/// Serialize a batch request to one JSONL line in the provider's batch
/// request envelope shape.
pub fn batch_request_line(request: &BatchRequest) -> String {
    serde_json::json!({
        "custom_id": request.custom_id,
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": request.body,
    })
    .to_string()
}

/// Split a `custom_id` back into its `(trialId, pmid)` parts. PMID is
/// unique per trial after dedup, so `__` is an unambiguous separator as
/// long as trial ids never themselves contain it (true for all three
/// registry id shapes).
pub fn split_custom_id(custom_id: &str) -> Option<(&str, &str)> {
    custom_id.split_once("__")
}

/// The provider-agnostic half of parsing a batch output line: pull out
/// `custom_id`, token usage, and the model's raw structured-output JSON
/// (or an error if the line is malformed or carries no message content).
/// Shared by the results classifier and the query-generation stages,
/// which differ only in what schema the content parses into.
struct RawBatchOutput {
    custom_id: String,
    input_tokens: u64,
    output_tokens: u64,
    content: Result<Value, String>,
}

fn parse_raw_batch_output(line: &str) -> Result<RawBatchOutput, PublinkError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| PublinkError::config(format!("malformed batch output line: {err}")))?;
    let custom_id = value
        .get("custom_id")
        .and_then(Value::as_str)
        .ok_or_else(|| PublinkError::config("batch output line missing custom_id"))?
        .to_string();

    let response = value.get("response").and_then(|r| r.get("body"));
    let (input_tokens, output_tokens) = response
        .and_then(|b| b.get("usage"))
        .map(|u| {
            (
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    let text = response
        .and_then(|b| b.get("choices"))
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str);

    let content = match text {
        Some(text) => serde_json::from_str::<Value>(text).map_err(|err| err.to_string()),
        None => Err("batch output line carried no message content".to_string()),
    };

    Ok(RawBatchOutput { custom_id, input_tokens, output_tokens, content })
}

/// Parse one line of a results-detection batch output file back into
/// `(customId, Classification)`, where `customId = "{trialId}__{pmid}"`.
pub fn parse_batch_output_line(line: &str) -> Result<(String, Classification), PublinkError> {
    let raw = parse_raw_batch_output(line)?;
    let classification = match raw.content {
        Ok(parsed) => parse_verdict(parsed, raw.input_tokens, raw.output_tokens),
        Err(message) => Classification {
            has_results: false,
            reason: String::new(),
            input_tokens: raw.input_tokens,
            output_tokens: raw.output_tokens,
            success: false,
            error: Some(message),
        },
    };
    Ok((raw.custom_id, classification))
}

/// Parse one line of a query-generation batch output file back into
/// `(trialId, rawContent)`, where `customId = trialId` (see
/// `QueryGenVariant::build_request`) and `rawContent` is the model's
/// structured output (a `{query}` or `{keywords, investigators,
/// search_strings, extra_queries}` bundle, left unvalidated here — the
/// reading strategy validates it against its own schema).
pub fn parse_query_gen_output_line(line: &str) -> Result<(String, Value), PublinkError> {
    let raw = parse_raw_batch_output(line)?;
    let content = raw
        .content
        .map_err(|message| PublinkError::config(format!("query-gen output for {}: {message}", raw.custom_id)))?;
    Ok((raw.custom_id, content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> Registration {
        Registration {
            trial_id: "NCT04267848".into(),
            brief_title: Some("A Study of Remdesivir".into()),
            ..Default::default()
        }
    }

    fn publication() -> Publication {
        Publication { pmid: "12345678".into(), ..Default::default() }
    }

    #[test]
    fn parse_verdict_accepts_well_formed_payload() {
        let verdict = parse_verdict(serde_json::json!({"has_results": true, "reason": "reports primary endpoint"}), 10, 20);
        assert!(verdict.success);
        assert!(verdict.has_results);
        assert_eq!(verdict.input_tokens, 10);
    }

    #[test]
    fn parse_verdict_rejects_malformed_payload_without_panicking() {
        let verdict = parse_verdict(serde_json::json!({"wrong_field": true}), 0, 0);
        assert!(!verdict.success);
        assert!(!verdict.has_results);
        assert!(verdict.error.is_some());
    }

    #[test]
    fn batch_request_custom_id_is_trial_and_pmid_joined() {
        let config = Config::default();
        let request = build_batch_request(&config, &registration(), &publication());
        assert_eq!(request.custom_id, "NCT04267848__12345678");
        assert!(request.estimated_tokens > 0);
    }

    #[test]
    fn split_custom_id_round_trips() {
        assert_eq!(split_custom_id("NCT04267848__12345678"), Some(("NCT04267848", "12345678")));
        assert_eq!(split_custom_id("not-a-pair"), None);
    }

    #[test]
    fn parse_query_gen_output_line_extracts_raw_content() {
        let line = serde_json::json!({
            "custom_id": "NCT04267848",
            "response": {
                "body": {
                    "choices": [{"message": {"content": "{\"query\": \"remdesivir AND covid\"}"}}],
                }
            }
        })
        .to_string();
        let (trial_id, content) = parse_query_gen_output_line(&line).unwrap();
        assert_eq!(trial_id, "NCT04267848");
        assert_eq!(content.get("query").and_then(Value::as_str), Some("remdesivir AND covid"));
    }

    #[test]
    fn parse_query_gen_output_line_errors_on_missing_content() {
        let line = serde_json::json!({"custom_id": "NCT04267848", "response": {"body": {}}}).to_string();
        assert!(parse_query_gen_output_line(&line).is_err());
    }

    #[test]
    fn parse_batch_output_line_extracts_classification() {
        let line = serde_json::json!({
            "custom_id": "NCT04267848__12345678",
            "response": {
                "body": {
                    "usage": {"prompt_tokens": 100, "completion_tokens": 40},
                    "choices": [{"message": {"content": "{\"has_results\": true, \"reason\": \"matches\"}"}}],
                }
            }
        })
        .to_string();
        let (custom_id, classification) = parse_batch_output_line(&line).unwrap();
        assert_eq!(custom_id, "NCT04267848__12345678");
        assert!(classification.success);
        assert!(classification.has_results);
        assert_eq!(classification.input_tokens, 100);
    }
}
