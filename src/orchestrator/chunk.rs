//! Chunks: bounded groups of classification requests submitted as a
//! single batch job, packed to respect both a request-count cap and a
//! byte cap with a safety margin.

use serde::{Deserialize, Serialize};

use crate::classifier::BatchRequest;
use crate::error::PublinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    InProgress,
    Validating,
    Finalizing,
    Completed,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub input_file: std::path::PathBuf,
    pub request_count: u32,
    pub estimated_tokens: u64,
    pub size_bytes: u64,
    pub status: ChunkStatus,
    pub batch_id: Option<String>,
    pub input_file_id: Option<String>,
    pub output_file_id: Option<String>,
    pub uploaded_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub processed_at: Option<u64>,
}

impl Chunk {
    fn new(index: usize, input_file: std::path::PathBuf) -> Self {
        Self {
            index,
            input_file,
            request_count: 0,
            estimated_tokens: 0,
            size_bytes: 0,
            status: ChunkStatus::Pending,
            batch_id: None,
            input_file_id: None,
            output_file_id: None,
            uploaded_at: None,
            completed_at: None,
            processed_at: None,
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self.status, ChunkStatus::Failed)
    }

    pub fn is_non_terminal(&self) -> bool {
        matches!(
            self.status,
            ChunkStatus::Uploaded | ChunkStatus::Validating | ChunkStatus::InProgress | ChunkStatus::Finalizing
        )
    }
}

/// Pack `requests` into chunks obeying `requestCount <= max_requests` and
/// `sizeBytes <= effective_max_bytes` simultaneously; writes each
/// chunk's JSONL body and returns the `Chunk` records. A single request
/// whose own serialized bytes exceed `effective_max_bytes` is a
/// misconfiguration, not a silently oversized chunk.
pub async fn pack(
    requests: Vec<BatchRequest>,
    max_requests: u32,
    effective_max_bytes: u64,
    output_dir: &std::path::Path,
) -> Result<Vec<Chunk>, PublinkError> {
    let mut chunks = Vec::new();
    let mut index = 0usize;
    let mut current = Chunk::new(index, output_dir.join(format!("chunk-{index}.jsonl")));
    let mut body = String::new();

    for request in &requests {
        let line = crate::classifier::batch_request_line(request);
        let line_bytes = (line.len() + 1) as u64;
        if line_bytes > effective_max_bytes {
            return Err(PublinkError::config(format!(
                "batch.maxBytesPerBatch is too small for a single request ({line_bytes} bytes, cap {effective_max_bytes})"
            )));
        }

        let would_overflow_bytes = current.size_bytes + line_bytes > effective_max_bytes;
        let would_overflow_count = current.request_count + 1 > max_requests;
        if current.request_count > 0 && (would_overflow_bytes || would_overflow_count) {
            crate::cache::save_atomic(&current.input_file, body.as_bytes()).await?;
            chunks.push(current);
            index += 1;
            current = Chunk::new(index, output_dir.join(format!("chunk-{index}.jsonl")));
            body.clear();
        }

        body.push_str(&line);
        body.push('\n');
        current.request_count += 1;
        current.size_bytes += line_bytes;
        current.estimated_tokens += request.estimated_tokens;
    }

    if current.request_count > 0 {
        crate::cache::save_atomic(&current.input_file, body.as_bytes()).await?;
        chunks.push(current);
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::BatchRequest;

    fn request(id: &str, tokens: u64) -> BatchRequest {
        BatchRequest {
            custom_id: id.to_string(),
            body: serde_json::json!({"model": "gpt-5"}),
            estimated_tokens: tokens,
        }
    }

    #[tokio::test]
    async fn packs_respect_request_count_cap() {
        let dir = std::env::temp_dir().join(format!("publink-chunk-test-{}", std::process::id()));
        let requests = vec![request("a", 10), request("b", 10), request("c", 10)];
        let chunks = pack(requests, 2, 1_000_000, &dir).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].request_count, 2);
        assert_eq!(chunks[1].request_count, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn oversized_single_request_is_a_config_error() {
        let dir = std::env::temp_dir().join(format!("publink-chunk-test2-{}", std::process::id()));
        let requests = vec![request("a", 10)];
        let err = pack(requests, 10, 4, &dir).await.unwrap_err();
        assert!(matches!(err, PublinkError::Config(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
