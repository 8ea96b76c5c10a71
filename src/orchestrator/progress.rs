//! The durable state machine driving a batch run. `Progress` is read at
//! startup and written after every observable state change — a new
//! registration, a new publication set, a stage transition, a chunk
//! status change, a daily-token increment — always before the next
//! external call, so a crash restores exactly the last persisted state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::PublinkError;
use crate::model::{Publication, UnitError};
use crate::orchestrator::chunk::Chunk;
use crate::registry::Registration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prep,
    QueryGenUpload,
    QueryGenPoll,
    QueryGenProcess,
    PubDiscovery,
    ResultGenPreparation,
    ResultGenUpload,
    ResultGenPoll,
    ResultGenProcess,
    Finalize,
    CostCalculation,
    Complete,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Prep => Stage::QueryGenUpload,
            Stage::QueryGenUpload => Stage::QueryGenPoll,
            Stage::QueryGenPoll => Stage::QueryGenProcess,
            Stage::QueryGenProcess => Stage::PubDiscovery,
            Stage::PubDiscovery => Stage::ResultGenPreparation,
            Stage::ResultGenPreparation => Stage::ResultGenUpload,
            Stage::ResultGenUpload => Stage::ResultGenPoll,
            Stage::ResultGenPoll => Stage::ResultGenProcess,
            Stage::ResultGenProcess => Stage::Finalize,
            Stage::Finalize => Stage::CostCalculation,
            Stage::CostCalculation => Stage::Complete,
            Stage::Complete => Stage::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Error,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowState {
    pub status: RowStatus,
    pub last_error: Option<String>,
    /// The input row's `dataset` column, if any; selects the max-date
    /// cutoff for validation runs.
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkippedCounts {
    pub no_trial_id: u64,
    pub no_registration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyTokens {
    pub date: String,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultGenBatch {
    pub chunks: Vec<Chunk>,
    pub daily_tokens_used: DailyTokens,
    pub total_estimated_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJobs {
    /// One entry per `requestCount <= maxRequestsPerBatch` chunk of
    /// trials; more than one once a run has enough trials to split.
    #[serde(default)]
    pub query_gen_v1: Vec<BatchJob>,
    #[serde(default)]
    pub query_gen_v2: Vec<BatchJob>,
    pub result_detection: ResultGenBatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicationSet {
    pub candidates: Vec<Publication>,
    pub filtered: Vec<Publication>,
    pub errors: Vec<UnitError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub input: PathBuf,
    pub stage: Stage,
    /// Trial ids in input order, populated during PREP; drives row
    /// iteration for every later stage and the final CSV's row order.
    #[serde(default)]
    pub trial_ids: Vec<String>,
    #[serde(default)]
    pub registrations: HashMap<String, Registration>,
    #[serde(default)]
    pub publications: HashMap<String, PublicationSet>,
    #[serde(default)]
    pub batch_jobs: BatchJobs,
    #[serde(default)]
    pub rows: HashMap<String, RowState>,
    pub started_at: u64,
    #[serde(default)]
    pub skipped_counts: SkippedCounts,
}

impl Progress {
    pub fn new(input: PathBuf) -> Self {
        let started_at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        Self {
            input,
            stage: Stage::Prep,
            trial_ids: Vec::new(),
            registrations: HashMap::new(),
            publications: HashMap::new(),
            batch_jobs: BatchJobs::default(),
            rows: HashMap::new(),
            started_at,
            skipped_counts: SkippedCounts::default(),
        }
    }

    fn file_path(output_dir: &Path) -> PathBuf {
        output_dir.join("progress.json")
    }

    /// Load existing progress from `output_dir`, or start fresh at PREP
    /// for `input` if none exists yet.
    pub async fn load_or_new(output_dir: &Path, input: PathBuf) -> Result<Self, PublinkError> {
        let path = Self::file_path(output_dir);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| PublinkError::CacheDecode { path: path.display().to_string(), source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(input)),
            Err(err) => Err(PublinkError::CacheIo(err)),
        }
    }

    /// Persist progress atomically. Every stage transition, every new
    /// registration/publication set, every chunk status change, and
    /// every daily-token increment calls this before the next external
    /// call — the at-most-once guarantee anchor.
    pub async fn save(&self, output_dir: &Path) -> Result<(), PublinkError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|source| PublinkError::CacheDecode { path: "progress.json".to_string(), source })?;
        crate::cache::save_atomic(&Self::file_path(output_dir), &bytes).await
    }

    pub fn advance(&mut self, to: Stage) {
        self.stage = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_the_documented_fsm() {
        assert_eq!(Stage::Prep.next(), Stage::QueryGenUpload);
        assert_eq!(Stage::CostCalculation.next(), Stage::Complete);
        assert_eq!(Stage::Complete.next(), Stage::Complete);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_stage() {
        let dir = std::env::temp_dir().join(format!("publink-progress-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let mut progress = Progress::new(PathBuf::from("input.csv"));
        progress.advance(Stage::PubDiscovery);
        progress.save(&dir).await.unwrap();

        let loaded = Progress::load_or_new(&dir, PathBuf::from("input.csv")).await.unwrap();
        assert_eq!(loaded.stage, Stage::PubDiscovery);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_progress_file_starts_fresh_at_prep() {
        let dir = std::env::temp_dir().join(format!("publink-progress-test2-{}", std::process::id()));
        let progress = Progress::load_or_new(&dir, PathBuf::from("input.csv")).await.unwrap();
        assert_eq!(progress.stage, Stage::Prep);
    }
}
