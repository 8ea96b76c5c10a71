//! The resumable batch orchestrator: the 12-stage state machine driving
//! tens of thousands of trials through discovery and classification via
//! the LLM's batch API, with chunking, daily token budgets, and
//! crash-safe progress. Each stage is idempotent: re-entering a stage
//! reads current `Progress` and skips any sub-task whose output already
//! exists.

pub mod chunk;
pub mod progress;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheType, Store};
use crate::classifier;
use crate::config::Config;
use crate::discovery::{self, DiscoveryContext};
use crate::error::PublinkError;
use crate::model::{Classification, Publication, UnitError};
use crate::orchestrator::chunk::{Chunk, ChunkStatus};
use crate::orchestrator::progress::{
    BatchJob, DailyTokens, Progress, PublicationSet, RowState, RowStatus, Stage,
};
use crate::output;
use crate::registry::Registration;
use crate::sources::llm::{BatchStatus, LlmClient};
use crate::sources::pubmed::PubmedClient;
use crate::sources::websearch::WebSearchClient;

/// A row read from the driving dataset.
#[derive(Debug, Clone)]
pub struct InputRow {
    pub trial_id: String,
    pub dataset: Option<String>,
}

/// Read the driving dataset: at least one column named (case-insensitive)
/// `nct_id`, `nctid`, `trial_id`, or `trialid`; an optional `dataset`
/// column selects the max-date cutoff for validation runs.
pub fn read_input_rows(path: &Path, delimiter: u8) -> Result<Vec<InputRow>, PublinkError> {
    let mut reader = csv::ReaderBuilder::new().delimiter(delimiter).from_path(path)?;
    let headers = reader.headers()?.clone();
    let trial_id_col = headers.iter().position(|h| {
        matches!(h.to_ascii_lowercase().as_str(), "nct_id" | "nctid" | "trial_id" | "trialid")
    });
    let dataset_col = headers.iter().position(|h| h.eq_ignore_ascii_case("dataset"));

    let Some(trial_id_col) = trial_id_col else {
        return Err(PublinkError::InvalidArgument(
            "input dataset has no nct_id/nctid/trial_id/trialid column".to_string(),
        ));
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let trial_id = record.get(trial_id_col).unwrap_or("").trim().to_string();
        let dataset = dataset_col.and_then(|i| record.get(i)).map(str::to_string);
        rows.push(InputRow { trial_id, dataset });
    }
    Ok(rows)
}

/// Dataset-dependent validation cutoff. Unknown datasets fall back to
/// the crate-wide default cutoff.
pub fn validation_cutoff(dataset: Option<&str>) -> &'static str {
    match dataset {
        Some("iv") => "2020-11-17",
        _ => "2023-02-15",
    }
}

/// Everything one batch run needs beyond `Progress` itself: client
/// handles, the three content-addressed stores, and run-level flags.
pub struct OrchestratorContext {
    pub config: Arc<Config>,
    pub pubmed: Arc<PubmedClient>,
    pub websearch: Arc<WebSearchClient>,
    pub llm: Arc<LlmClient>,
    pub registrations_store: Store,
    pub publications_store: Store,
    pub classifications_store: Store,
    pub output_dir: PathBuf,
    pub local_registrations: Option<PathBuf>,
    pub query_pool_v1_dir: PathBuf,
    pub query_pool_v2_dir: PathBuf,
    pub delimiter: u8,
    pub poll_interval: Duration,
    pub validation_run: bool,
    pub step_by_step: bool,
    pub cancel: CancellationToken,
}

impl OrchestratorContext {
    fn discovery_context(&self) -> DiscoveryContext {
        DiscoveryContext {
            pubmed: self.pubmed.clone(),
            websearch: self.websearch.clone(),
            llm: self.llm.clone(),
            config: self.config.clone(),
            query_pool_v1_dir: Some(self.query_pool_v1_dir.clone()),
            query_pool_v2_dir: Some(self.query_pool_v2_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused(Stage),
    Cancelled,
}

/// The batch driver: owns `Progress` for one run and advances it stage
/// by stage until `COMPLETE`, a fatal error, or cancellation.
pub struct Driver {
    ctx: OrchestratorContext,
    progress: Progress,
}

impl Driver {
    pub async fn new(ctx: OrchestratorContext, input: PathBuf) -> Result<Self, PublinkError> {
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        let progress = Progress::load_or_new(&ctx.output_dir, input).await?;
        Ok(Self { ctx, progress })
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub async fn run(&mut self) -> Result<RunOutcome, PublinkError> {
        loop {
            if self.ctx.cancel.is_cancelled() {
                self.progress.save(&self.ctx.output_dir).await?;
                return Ok(RunOutcome::Cancelled);
            }
            if self.progress.stage == Stage::Complete {
                return Ok(RunOutcome::Completed);
            }

            let stage = self.progress.stage;
            info!(?stage, "entering orchestrator stage");
            self.run_stage(stage).await?;
            self.progress.save(&self.ctx.output_dir).await?;

            if self.ctx.step_by_step {
                return Ok(RunOutcome::Paused(self.progress.stage));
            }

            let still_polling = self.progress.stage == stage
                && matches!(stage, Stage::QueryGenPoll | Stage::ResultGenPoll);
            if still_polling {
                tokio::select! {
                    _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                    _ = self.ctx.cancel.cancelled() => {}
                }
            }
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<(), PublinkError> {
        match stage {
            Stage::Prep => self.stage_prep().await,
            Stage::QueryGenUpload => self.stage_query_gen_upload().await,
            Stage::QueryGenPoll => self.stage_query_gen_poll().await,
            Stage::QueryGenProcess => self.stage_query_gen_process().await,
            Stage::PubDiscovery => self.stage_pub_discovery().await,
            Stage::ResultGenPreparation => self.stage_result_gen_preparation().await,
            Stage::ResultGenUpload => self.stage_result_gen_upload().await,
            Stage::ResultGenPoll => self.stage_result_gen_poll().await,
            Stage::ResultGenProcess => self.stage_result_gen_process().await,
            Stage::Finalize => self.stage_finalize().await,
            Stage::CostCalculation => self.stage_cost_calculation().await,
            Stage::Complete => Ok(()),
        }
    }

    /// PREP: ensure a registration for every row with a trial id.
    async fn stage_prep(&mut self) -> Result<(), PublinkError> {
        let rows = read_input_rows(&self.progress.input, self.ctx.delimiter)?;
        for row in rows {
            if row.trial_id.is_empty() {
                self.progress.skipped_counts.no_trial_id += 1;
                continue;
            }
            let normalized = crate::registry::normalize_trial_id(&row.trial_id);
            if !self.progress.trial_ids.contains(&normalized) {
                self.progress.trial_ids.push(normalized.clone());
            }
            self.progress.rows.entry(normalized.clone()).or_insert(RowState {
                status: RowStatus::Processing,
                last_error: None,
                dataset: row.dataset,
            });

            if self.progress.registrations.contains_key(&normalized) {
                continue;
            }
            let local = self.ctx.local_registrations.as_deref();
            match self
                .ctx
                .registrations_store
                .get_or_produce(&normalized, CacheType::Registration, self.ctx.config.cache_ttl_for("registration"), || {
                    let normalized = normalized.clone();
                    async move { crate::registry::fetch(&normalized, local).await }
                })
                .await
            {
                Ok(registration) => {
                    self.progress.registrations.insert(normalized, registration);
                }
                Err(err) => {
                    warn!(trial_id = %normalized, error = %err, "registration fetch failed");
                    if let Some(row) = self.progress.rows.get_mut(&normalized) {
                        row.status = RowStatus::Error;
                        row.last_error = Some(err.to_string());
                    }
                }
            }
        }
        self.progress.advance(Stage::QueryGenUpload);
        Ok(())
    }

    /// QUERY_GEN_UPLOAD/POLL/PROCESS are only meaningful when
    /// `pubmed_gpt_v1`/`v2` are enabled; otherwise they are a no-op pass
    /// straight through to discovery, since the live-style synchronous
    /// LLM call path is used directly in PUB_DISCOVERY instead.
    fn query_gen_enabled(&self) -> bool {
        self.ctx.config.strategies.iter().any(|s| {
            s == crate::model::STRATEGY_PUBMED_GPT_V1 || s == crate::model::STRATEGY_PUBMED_GPT_V2
        })
    }

    async fn stage_query_gen_upload(&mut self) -> Result<(), PublinkError> {
        if !self.query_gen_enabled() {
            self.progress.advance(Stage::PubDiscovery);
            return Ok(());
        }
        if self.progress.batch_jobs.query_gen_v1.is_empty() {
            self.upload_query_gen_batches(QueryGenVariant::V1).await?;
        }
        if self.progress.batch_jobs.query_gen_v2.is_empty() {
            self.upload_query_gen_batches(QueryGenVariant::V2).await?;
        }
        self.progress.advance(Stage::QueryGenPoll);
        Ok(())
    }

    /// Build one request per trial, split into chunks obeying
    /// `requestCount <= maxRequestsPerBatch`, and upload+create a batch
    /// job per chunk. Progress is saved after each chunk's job is
    /// recorded, before the next chunk's `upload_file` call.
    async fn upload_query_gen_batches(&mut self, variant: QueryGenVariant) -> Result<(), PublinkError> {
        let requests: Vec<serde_json::Value> = self
            .progress
            .trial_ids
            .iter()
            .filter_map(|trial_id| {
                self.progress
                    .registrations
                    .get(trial_id)
                    .map(|registration| variant.build_request(&self.ctx.config, registration))
            })
            .collect();

        let max_requests = self.ctx.config.max_requests_per_batch.max(1) as usize;
        for batch in requests.chunks(max_requests) {
            let mut body = String::new();
            for request in batch {
                body.push_str(&request.to_string());
                body.push('\n');
            }
            let input_file_id = self.ctx.llm.upload_file(body.into_bytes()).await?;
            let handle = self
                .ctx
                .llm
                .create_batch(&input_file_id, "/v1/chat/completions", &self.ctx.config.completion_window)
                .await?;
            let job = BatchJob {
                id: handle.batch_id,
                status: format!("{:?}", handle.status),
                input_file_id,
                output_file_id: handle.output_file_id,
            };
            match variant {
                QueryGenVariant::V1 => self.progress.batch_jobs.query_gen_v1.push(job),
                QueryGenVariant::V2 => self.progress.batch_jobs.query_gen_v2.push(job),
            }
            self.progress.save(&self.ctx.output_dir).await?;
        }
        Ok(())
    }

    async fn stage_query_gen_poll(&mut self) -> Result<(), PublinkError> {
        self.poll_query_gen_jobs(QueryGenVariant::V1).await?;
        self.poll_query_gen_jobs(QueryGenVariant::V2).await?;

        let all_completed = self
            .progress
            .batch_jobs
            .query_gen_v1
            .iter()
            .chain(self.progress.batch_jobs.query_gen_v2.iter())
            .all(|job| job.output_file_id.is_some());
        if all_completed {
            self.progress.advance(Stage::QueryGenProcess);
        }
        Ok(())
    }

    /// Poll every job of one variant in order, saving Progress after
    /// each job's status is updated, before the next job's
    /// `retrieve_batch` call.
    async fn poll_query_gen_jobs(&mut self, variant: QueryGenVariant) -> Result<(), PublinkError> {
        let count = match variant {
            QueryGenVariant::V1 => self.progress.batch_jobs.query_gen_v1.len(),
            QueryGenVariant::V2 => self.progress.batch_jobs.query_gen_v2.len(),
        };
        for index in 0..count {
            let batch_id = match variant {
                QueryGenVariant::V1 => self.progress.batch_jobs.query_gen_v1[index].id.clone(),
                QueryGenVariant::V2 => self.progress.batch_jobs.query_gen_v2[index].id.clone(),
            };
            let handle = self.ctx.llm.retrieve_batch(&batch_id).await?;
            let status = format!("{:?}", handle.status);

            let jobs = match variant {
                QueryGenVariant::V1 => &mut self.progress.batch_jobs.query_gen_v1,
                QueryGenVariant::V2 => &mut self.progress.batch_jobs.query_gen_v2,
            };
            jobs[index].status = status.clone();
            if handle.status.is_terminal_failure() {
                self.progress.save(&self.ctx.output_dir).await?;
                return Err(PublinkError::LlmBatchFailed { batch_id, status });
            }
            if handle.status == BatchStatus::Completed {
                jobs[index].output_file_id = handle.output_file_id;
            }
            self.progress.save(&self.ctx.output_dir).await?;
        }
        Ok(())
    }

    async fn stage_query_gen_process(&mut self) -> Result<(), PublinkError> {
        for job in self.progress.batch_jobs.query_gen_v1.clone() {
            self.process_query_gen_output(&job, &self.ctx.query_pool_v1_dir.clone()).await?;
        }
        for job in self.progress.batch_jobs.query_gen_v2.clone() {
            self.process_query_gen_output(&job, &self.ctx.query_pool_v2_dir.clone()).await?;
        }
        self.progress.advance(Stage::PubDiscovery);
        Ok(())
    }

    async fn process_query_gen_output(&self, job: &BatchJob, pool_dir: &Path) -> Result<(), PublinkError> {
        let Some(output_file_id) = &job.output_file_id else { return Ok(()) };
        let bytes = self.ctx.llm.download_file(output_file_id).await?;
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match classifier::parse_query_gen_output_line(line) {
                Ok((trial_id, content)) => {
                    let path = pool_dir.join(format!("{trial_id}.json"));
                    let body = serde_json::to_vec(&content).unwrap_or_default();
                    crate::cache::save_atomic(&path, &body).await.ok();
                }
                Err(err) => {
                    warn!(error = %err, "dropping unparsable query-gen batch output line");
                }
            }
        }
        Ok(())
    }

    /// PUB_DISCOVERY: strategies, union+enrich, max-filter then
    /// min-filter, per cached registration.
    async fn stage_pub_discovery(&mut self) -> Result<(), PublinkError> {
        let strategies = discovery::enabled_strategies(&self.ctx.config);
        let discovery_ctx = self.ctx.discovery_context();
        let cutoff_default = validation_cutoff(None);

        for trial_id in self.progress.trial_ids.clone() {
            if self.progress.publications.contains_key(&trial_id) {
                continue;
            }
            let Some(registration) = self.progress.registrations.get(&trial_id).cloned() else {
                self.progress.skipped_counts.no_registration += 1;
                continue;
            };

            let (per_strategy, errors) = discovery::run_all(&registration, &discovery_ctx, &strategies).await;
            let candidates = discovery::enrich::dedup(per_strategy);
            let enriched = match discovery::enrich::enrich(
                &self.ctx.pubmed,
                &self.ctx.publications_store,
                self.ctx.config.cache_ttl_for("publication"),
                candidates,
            )
            .await
            {
                Ok(enriched) => enriched,
                Err(err) => {
                    self.progress.publications.insert(
                        trial_id.clone(),
                        PublicationSet { candidates: Vec::new(), filtered: Vec::new(), errors: vec![UnitError {
                            fn_name: "enrich".to_string(),
                            message: err.to_string(),
                        }] },
                    );
                    continue;
                }
            };

            let cutoff = if self.ctx.validation_run {
                let dataset = self.progress.rows.get(&trial_id).and_then(|r| r.dataset.as_deref());
                validation_cutoff(dataset)
            } else {
                cutoff_default
            };
            let max_filtered = discovery::filters::max_date_filter(enriched, cutoff);
            let min_filtered =
                discovery::filters::min_date_filter(max_filtered.eligible, registration.start_date.as_deref());

            let mut filtered = max_filtered.filtered;
            filtered.extend(min_filtered.filtered);

            self.progress.publications.insert(
                trial_id,
                PublicationSet { candidates: min_filtered.eligible, filtered, errors },
            );
        }
        self.progress.advance(Stage::ResultGenPreparation);
        Ok(())
    }

    /// RESULT_GEN_PREPARATION: build one batch request per (trial, pmid)
    /// pair and pack into size/count-bounded chunks.
    async fn stage_result_gen_preparation(&mut self) -> Result<(), PublinkError> {
        let mut requests = Vec::new();
        for trial_id in &self.progress.trial_ids {
            let Some(registration) = self.progress.registrations.get(trial_id) else { continue };
            let Some(publications) = self.progress.publications.get(trial_id) else { continue };
            for publication in &publications.candidates {
                requests.push(classifier::build_batch_request(&self.ctx.config, registration, publication));
            }
        }

        if requests.is_empty() {
            self.progress.advance(Stage::Finalize);
            return Ok(());
        }

        let total_estimated_tokens = requests.iter().map(|r| r.estimated_tokens).sum();
        let chunk_dir = self.ctx.output_dir.join("chunks");
        let chunks = chunk::pack(
            requests,
            self.ctx.config.max_requests_per_batch,
            self.ctx.config.effective_max_bytes(),
            &chunk_dir,
        )
        .await?;

        self.progress.batch_jobs.result_detection.chunks = chunks;
        self.progress.batch_jobs.result_detection.total_estimated_tokens = total_estimated_tokens;
        self.progress.advance(Stage::ResultGenUpload);
        Ok(())
    }

    /// RESULT_GEN_UPLOAD: take pending chunks in order, stop at the
    /// daily token budget, upload the rest in parallel.
    async fn stage_result_gen_upload(&mut self) -> Result<(), PublinkError> {
        let today = today_string();
        let daily = &mut self.progress.batch_jobs.result_detection.daily_tokens_used;
        if daily.date != today {
            daily.date = today.clone();
            daily.tokens = 0;
        }
        let used = self.progress.batch_jobs.result_detection.daily_tokens_used.tokens;
        let budget = self.ctx.config.max_tokens_per_day;

        let mut remaining = budget.saturating_sub(used);
        let mut to_upload = Vec::new();
        for chunk in &self.progress.batch_jobs.result_detection.chunks {
            if chunk.status != ChunkStatus::Pending {
                continue;
            }
            if chunk.estimated_tokens > remaining {
                if to_upload.is_empty() {
                    return Err(PublinkError::DailyBudgetExhausted {
                        used,
                        needed: chunk.estimated_tokens,
                        budget,
                    });
                }
                break;
            }
            remaining -= chunk.estimated_tokens;
            to_upload.push(chunk.index);
        }

        if to_upload.is_empty() {
            self.progress.advance(Stage::ResultGenPoll);
            return Ok(());
        }

        for index in to_upload {
            let chunk = &self.progress.batch_jobs.result_detection.chunks[index];
            let bytes = tokio::fs::read(&chunk.input_file).await?;
            let input_file_id = self.ctx.llm.upload_file(bytes).await?;
            let handle = self
                .ctx
                .llm
                .create_batch(&input_file_id, "/v1/chat/completions", &self.ctx.config.completion_window)
                .await?;
            let estimated_tokens = chunk.estimated_tokens;

            let chunk = &mut self.progress.batch_jobs.result_detection.chunks[index];
            chunk.status = ChunkStatus::Uploaded;
            chunk.batch_id = Some(handle.batch_id);
            chunk.input_file_id = Some(input_file_id);
            chunk.uploaded_at = Some(now_secs());
            self.progress.batch_jobs.result_detection.daily_tokens_used.tokens += estimated_tokens;
            // Save before the next chunk's upload_file/create_batch calls so a
            // crash mid-loop never re-uploads an already-uploaded chunk or
            // double-counts its tokens against the daily budget.
            self.progress.save(&self.ctx.output_dir).await?;
        }

        self.progress.advance(Stage::ResultGenPoll);
        Ok(())
    }

    /// RESULT_GEN_POLL: poll every non-terminal chunk in parallel.
    async fn stage_result_gen_poll(&mut self) -> Result<(), PublinkError> {
        let pending: Vec<usize> = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .filter(|c| c.is_non_terminal())
            .map(|c| c.index)
            .collect();

        for index in pending {
            let Some(batch_id) = self.progress.batch_jobs.result_detection.chunks[index].batch_id.clone() else {
                continue;
            };
            let handle = self.ctx.llm.retrieve_batch(&batch_id).await?;
            if handle.status.is_terminal_failure() {
                self.progress.batch_jobs.result_detection.chunks[index].status = ChunkStatus::Failed;
                self.progress.save(&self.ctx.output_dir).await?;
                return Err(PublinkError::LlmBatchFailed { batch_id, status: format!("{:?}", handle.status) });
            }
            let status = match handle.status {
                BatchStatus::Validating => ChunkStatus::Validating,
                BatchStatus::InProgress => ChunkStatus::InProgress,
                BatchStatus::Finalizing => ChunkStatus::Finalizing,
                BatchStatus::Completed => ChunkStatus::Completed,
                BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled => ChunkStatus::Failed,
            };
            let chunk = &mut self.progress.batch_jobs.result_detection.chunks[index];
            chunk.status = status;
            if chunk.status == ChunkStatus::Completed {
                chunk.output_file_id = handle.output_file_id;
                chunk.completed_at = Some(now_secs());
            }
            // Save before the next chunk's retrieve_batch call, per chunk.
            self.progress.save(&self.ctx.output_dir).await?;
        }

        let still_pending = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .any(|c| c.is_non_terminal());
        if !still_pending {
            self.progress.advance(Stage::ResultGenProcess);
        }
        Ok(())
    }

    /// RESULT_GEN_PROCESS: download and parse every completed chunk's
    /// output, writing classifications; loop back to UPLOAD if any
    /// chunks are still pending (next day's budget), else FINALIZE.
    async fn stage_result_gen_process(&mut self) -> Result<(), PublinkError> {
        let completed: Vec<usize> = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.index)
            .collect();

        for index in completed {
            let output_file_id = self.progress.batch_jobs.result_detection.chunks[index].output_file_id.clone();
            let Some(output_file_id) = output_file_id else { continue };
            let bytes = self.ctx.llm.download_file(&output_file_id).await?;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let (custom_id, classification) = classifier::parse_batch_output_line(line)?;
                self.ctx
                    .classifications_store
                    .write(&custom_id, CacheType::Classification, self.ctx.config.cache_ttl_for("classification"), &classification)
                    .await?;
            }
            self.progress.batch_jobs.result_detection.chunks[index].status = ChunkStatus::Processed;
            self.progress.batch_jobs.result_detection.chunks[index].processed_at = Some(now_secs());
            // Save before the next chunk's download_file call.
            self.progress.save(&self.ctx.output_dir).await?;
        }

        let any_pending = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .any(|c| c.status == ChunkStatus::Pending);
        if any_pending {
            self.progress.advance(Stage::ResultGenUpload);
        } else {
            self.progress.advance(Stage::Finalize);
        }
        Ok(())
    }

    /// FINALIZE: join registration, publications, and classifications
    /// per row; write the JSON sidecar, then append the CSV row.
    async fn stage_finalize(&mut self) -> Result<(), PublinkError> {
        for trial_id in self.progress.trial_ids.clone() {
            let Some(registration) = self.progress.registrations.get(&trial_id).cloned() else { continue };
            let publications = self.progress.publications.get(&trial_id).cloned().unwrap_or_default();

            let mut classifications = BTreeMap::new();
            for publication in &publications.candidates {
                if let Some(classification) = self
                    .ctx
                    .classifications_store
                    .read::<Classification>(&format!("{trial_id}__{}", publication.pmid))
                    .await?
                {
                    classifications.insert(publication.pmid.clone(), classification);
                }
            }

            let summary = output::summarize(&registration, &publications.candidates, &publications.errors, &classifications);
            output::write_trial_sidecar(
                &self.ctx.output_dir,
                &registration,
                &publications.candidates,
                &publications.filtered,
                &classifications,
                &summary,
            )
            .await?;
            output::append_csv_row(&self.ctx.output_dir.join("summary.csv"), &summary)?;

            if let Some(row) = self.progress.rows.get_mut(&trial_id) {
                row.status = if summary.has_error { RowStatus::Error } else { RowStatus::Success };
            }
        }
        self.progress.advance(Stage::CostCalculation);
        Ok(())
    }

    /// COST_CALCULATION: sum tokens across all classifications and
    /// billed query-gen batches this run, grouped by model; non-blocking
    /// footer, always advances to COMPLETE.
    async fn stage_cost_calculation(&mut self) -> Result<(), PublinkError> {
        let mut usage_by_model: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for trial_id in &self.progress.trial_ids {
            let Some(publications) = self.progress.publications.get(trial_id) else { continue };
            for publication in &publications.candidates {
                if let Some(classification) = self
                    .ctx
                    .classifications_store
                    .read::<Classification>(&format!("{trial_id}__{}", publication.pmid))
                    .await?
                {
                    let entry = usage_by_model.entry(self.ctx.config.models.results.clone()).or_default();
                    entry.0 += classification.input_tokens;
                    entry.1 += classification.output_tokens;
                }
            }
        }
        output::write_cost_summary(&self.ctx.output_dir, &self.ctx.config, &usage_by_model).await?;
        self.progress.advance(Stage::Complete);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum QueryGenVariant {
    V1,
    V2,
}

impl QueryGenVariant {
    fn build_request(&self, config: &Config, registration: &Registration) -> serde_json::Value {
        let (system_path, model, reasoning, max_tokens, schema) = match self {
            QueryGenVariant::V1 => (
                &config.system_prompts.query_v1,
                &config.models.query_v1,
                config.reasoning.query_v1,
                config.max_tokens_query_v1,
                serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
            ),
            QueryGenVariant::V2 => (
                &config.system_prompts.query_v2,
                &config.models.query_v2,
                config.reasoning.query_v2,
                config.max_tokens_query_v2,
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "keywords": {"type": "array", "items": {"type": "string"}},
                        "investigators": {"type": "array", "items": {"type": "string"}},
                        "search_strings": {"type": "array", "items": {"type": "string"}},
                        "extra_queries": {"type": "array", "items": {"type": "string"}},
                    },
                    "required": ["keywords", "investigators", "search_strings", "extra_queries"],
                }),
            ),
        };
        let system = std::fs::read_to_string(system_path).unwrap_or_default();
        let user = serde_json::json!({
            "trialId": registration.trial_id,
            "briefTitle": registration.brief_title,
            "officialTitle": registration.official_title,
            "briefSummary": registration.brief_summary,
            "conditions": registration.conditions,
            "interventions": registration.interventions,
            "investigatorFullName": registration.investigator_full_name,
        })
        .to_string();

        serde_json::json!({
            "custom_id": registration.trial_id,
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": {
                "model": model,
                "reasoning_effort": reasoning,
                "max_completion_tokens": max_tokens,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {"name": "structured_response", "schema": schema, "strict": true},
                },
            },
        })
    }
}

fn today_string() -> String {
    let secs = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = secs / 86_400;
    format!("day-{days}")
}

fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_cutoff_is_dataset_dependent() {
        assert_eq!(validation_cutoff(Some("iv")), "2020-11-17");
        assert_eq!(validation_cutoff(Some("unknown")), "2023-02-15");
        assert_eq!(validation_cutoff(None), "2023-02-15");
    }

    #[test]
    fn read_input_rows_detects_nct_id_column_case_insensitively() {
        let dir = std::env::temp_dir().join(format!("publink-input-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("input.csv");
        std::fs::write(&path, "NCT_ID,dataset\nNCT04267848,iv\n").unwrap();
        let rows = read_input_rows(&path, b',').unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trial_id, "NCT04267848");
        assert_eq!(rows[0].dataset.as_deref(), Some("iv"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
