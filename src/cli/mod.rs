//! Top-level CLI parsing and command execution: the batch driver, the
//! live driver, the health check, and a read-only progress viewer.

pub mod health;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::Store;
use crate::config::Config;
use crate::error::PublinkError;
use crate::orchestrator::progress::{Progress, RowStatus, Stage};
use crate::orchestrator::{Driver, OrchestratorContext, RunOutcome};
use crate::sources::llm::LlmClient;
use crate::sources::pubmed::PubmedClient;
use crate::sources::websearch::WebSearchClient;

#[derive(Parser, Debug)]
#[command(
    name = "publink",
    about = "Discover and classify clinical-trial result publications across registries",
    version,
    after_help = "\
EXAMPLES:
  publink batch --input trials.csv --output-dir ./run
  publink live --input trials.csv --output-dir ./run --retry-errors
  publink health
  publink progress show --output-dir ./run"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a TOML config file (default: publink.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable HTTP response caching (always fetch fresh data)
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Output as JSON instead of Markdown (health / progress show only)
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the resumable batch driver over a driving dataset
    Batch(BatchArgs),
    /// Run the synchronous, per-row live driver
    Live(LiveArgs),
    /// Check connectivity to every external dependency
    Health {
        /// Check external APIs only, skip the local cache-dir probe
        #[arg(long)]
        apis_only: bool,
    },
    /// Inspect a run's persisted progress without resuming it
    Progress {
        #[command(subcommand)]
        command: ProgressCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProgressCommand {
    /// Print the current stage and per-stage counts
    Show {
        /// Directory holding the run's progress.json
        #[arg(long)]
        output_dir: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct BatchArgs {
    /// Driving dataset (CSV with an nct_id/trial_id column)
    #[arg(long)]
    pub input: PathBuf,
    /// Directory for progress, chunks, sidecars, and the summary CSV
    #[arg(long, default_value = "./output")]
    pub output_dir: PathBuf,
    /// Field delimiter for the input CSV
    #[arg(long, default_value_t = ',')]
    pub delimiter: char,
    /// Seconds to wait between batch-status polls
    #[arg(long, default_value_t = 60)]
    pub poll_interval: u64,
    /// Use the dataset-column-dependent validation cutoff instead of the default
    #[arg(long)]
    pub validation_run: bool,
    /// Directory of local {trialId}.json registration files, checked before the network
    #[arg(long)]
    pub local_registrations: Option<PathBuf>,
    /// Run exactly one stage transition, then exit
    #[arg(long)]
    pub step_by_step: bool,
}

#[derive(clap::Args, Debug)]
pub struct LiveArgs {
    /// Driving dataset (CSV with an nct_id/trial_id column)
    #[arg(long)]
    pub input: PathBuf,
    /// Directory for sidecars and the summary CSV
    #[arg(long, default_value = "./output")]
    pub output_dir: PathBuf,
    /// Field delimiter for the input CSV
    #[arg(long, default_value_t = ',')]
    pub delimiter: char,
    /// Use the dataset-column-dependent validation cutoff instead of the default
    #[arg(long)]
    pub validation_run: bool,
    /// Directory of local {trialId}.json registration files, checked before the network
    #[arg(long)]
    pub local_registrations: Option<PathBuf>,
    /// Re-run only rows whose last recorded status was `error`
    #[arg(long)]
    pub retry_errors: bool,
}

/// Dispatch a parsed `Cli` to its command, returning the process exit
/// code. `1` on a generic fatal error, `2` on `DailyBudgetExhausted`,
/// `3` on a `ConfigError`.
pub async fn run(cli: Cli) -> u8 {
    crate::sources::set_no_cache(cli.no_cache);

    let result = match cli.command {
        Command::Batch(args) => run_batch(cli.config.as_deref(), args).await,
        Command::Live(args) => run_live(cli.config.as_deref(), args).await,
        Command::Health { apis_only } => run_health(apis_only, cli.json).await,
        Command::Progress { command: ProgressCommand::Show { output_dir } } => {
            run_progress_show(&output_dir, cli.json).await
        }
    };

    match result {
        Ok(()) => 0,
        Err(err @ PublinkError::DailyBudgetExhausted { .. }) => {
            eprintln!("{err}");
            2
        }
        Err(err @ PublinkError::Config(_)) => {
            eprintln!("{err}");
            3
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

fn install_ctrl_c_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received SIGINT, finishing in-flight work before exit");
            child.cancel();
        }
    });
    token
}

async fn build_orchestrator_context(
    config_path: Option<&std::path::Path>,
    output_dir: PathBuf,
    delimiter: char,
    poll_interval: u64,
    validation_run: bool,
    local_registrations: Option<PathBuf>,
    step_by_step: bool,
) -> Result<OrchestratorContext, PublinkError> {
    let config = Arc::new(Config::load(config_path)?);
    let pubmed = Arc::new(PubmedClient::new()?);
    let websearch = Arc::new(WebSearchClient::new()?);
    let llm = Arc::new(LlmClient::new()?);

    Ok(OrchestratorContext {
        config,
        pubmed,
        websearch,
        llm,
        registrations_store: Store::new(output_dir.join("cache").join("registrations")),
        publications_store: Store::new(output_dir.join("cache").join("publications")),
        classifications_store: Store::new(output_dir.join("cache").join("classifications")),
        query_pool_v1_dir: output_dir.join("query-pool").join("v1"),
        query_pool_v2_dir: output_dir.join("query-pool").join("v2"),
        output_dir,
        local_registrations,
        delimiter: delimiter as u8,
        poll_interval: std::time::Duration::from_secs(poll_interval),
        validation_run,
        step_by_step,
        cancel: install_ctrl_c_handler(),
    })
}

/// An advisory lock file preventing two drivers from running against the
/// same `output_dir` concurrently. Created with `create_new` so a second
/// run fails fast instead of corrupting Progress; removed on clean exit.
struct RunLock(PathBuf);

impl RunLock {
    async fn acquire(output_dir: &std::path::Path) -> Result<Self, PublinkError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let path = output_dir.join(".publink.lock");
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => Ok(Self(path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(PublinkError::config(format!(
                "another run already holds the lock at {} (remove it if that run is no longer alive)",
                path.display()
            ))),
            Err(err) => Err(PublinkError::CacheIo(err)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn run_batch(config_path: Option<&std::path::Path>, args: BatchArgs) -> Result<(), PublinkError> {
    let started = std::time::Instant::now();
    let lock = RunLock::acquire(&args.output_dir).await?;
    let ctx = build_orchestrator_context(
        config_path,
        args.output_dir,
        args.delimiter,
        args.poll_interval,
        args.validation_run,
        args.local_registrations,
        args.step_by_step,
    )
    .await?;

    let mut driver = Driver::new(ctx, args.input).await?;
    loop {
        match driver.run().await? {
            RunOutcome::Completed => {
                print_run_summary("batch run complete", driver.progress(), started.elapsed());
                break;
            }
            RunOutcome::Cancelled => {
                info!("batch run cancelled, progress saved for resume");
                break;
            }
            RunOutcome::Paused(stage) => {
                info!(?stage, "step-by-step: stage complete, exiting");
                break;
            }
        }
    }
    drop(lock);
    Ok(())
}

/// One-line success/error/skipped/runtime summary, logged at `info` and
/// echoed to stdout so it lands both in structured log sinks and in an
/// operator's terminal.
fn print_run_summary(label: &str, progress: &Progress, elapsed: std::time::Duration) {
    let success = progress.rows.values().filter(|r| r.status == RowStatus::Success).count();
    let error = progress.rows.values().filter(|r| r.status == RowStatus::Error).count();
    let skipped = progress.skipped_counts.no_trial_id + progress.skipped_counts.no_registration;
    info!(success, error, skipped, elapsed_secs = elapsed.as_secs(), "{label}");
    println!(
        "{label}: {success} success, {error} error, {skipped} skipped, {:.1}s elapsed",
        elapsed.as_secs_f64()
    );
}

async fn run_live(config_path: Option<&std::path::Path>, args: LiveArgs) -> Result<(), PublinkError> {
    let config = Arc::new(Config::load(config_path)?);
    let pubmed = Arc::new(PubmedClient::new()?);
    let websearch = Arc::new(WebSearchClient::new()?);
    let llm = Arc::new(LlmClient::new()?);
    let cancel = install_ctrl_c_handler();

    tokio::fs::create_dir_all(&args.output_dir).await?;
    let _lock = RunLock::acquire(&args.output_dir).await?;
    let publications_store = Store::new(args.output_dir.join("cache").join("publications"));

    let rows = crate::orchestrator::read_input_rows(&args.input, args.delimiter as u8)?;
    let already_succeeded = if args.retry_errors {
        read_completed_trial_ids(&args.output_dir)?
    } else {
        std::collections::HashSet::new()
    };

    let discovery_ctx = crate::discovery::DiscoveryContext {
        pubmed: pubmed.clone(),
        websearch: websearch.clone(),
        llm: llm.clone(),
        config: config.clone(),
        query_pool_v1_dir: None,
        query_pool_v2_dir: None,
    };
    let strategies = crate::discovery::enabled_strategies(&config);

    let started = std::time::Instant::now();
    let mut success = 0u64;
    let mut error = 0u64;
    let mut skipped = 0u64;

    for row in rows {
        if cancel.is_cancelled() {
            warn!("live run cancelled");
            break;
        }
        let trial_id = row.trial_id.trim();
        if trial_id.is_empty() {
            skipped += 1;
            continue;
        }

        if args.retry_errors && already_succeeded.contains(trial_id) {
            skipped += 1;
            continue;
        }

        match process_live_row(trial_id, row.dataset.as_deref(), &args, &config, &pubmed, &publications_store, &llm, &discovery_ctx, &strategies).await {
            Ok(()) => success += 1,
            Err(err) => {
                error += 1;
                warn!(trial_id, %err, "live row failed");
            }
        }
    }

    let elapsed = started.elapsed();
    info!(success, error, skipped, elapsed_secs = elapsed.as_secs(), "live run complete");
    println!("live run complete: {success} success, {error} error, {skipped} skipped, {:.1}s elapsed", elapsed.as_secs_f64());

    Ok(())
}

/// Trial ids whose last summary row recorded `has_error=false`, read
/// back from a prior run's CSV so `--retry-errors` can skip them.
fn read_completed_trial_ids(output_dir: &std::path::Path) -> Result<std::collections::HashSet<String>, PublinkError> {
    let path = output_dir.join("summary.csv");
    if !path.exists() {
        return Ok(std::collections::HashSet::new());
    }
    let mut reader = csv::ReaderBuilder::new().from_path(&path)?;
    let headers = reader.headers()?.clone();
    let trial_id_col = headers.iter().position(|h| h == "trial_id").unwrap_or(1);
    let has_error_col = headers.iter().position(|h| h == "has_error").unwrap_or(3);

    let mut done = std::collections::HashSet::new();
    for record in reader.records() {
        let record = record?;
        let has_error = record.get(has_error_col).unwrap_or("true") == "true";
        if !has_error && let Some(trial_id) = record.get(trial_id_col) {
            done.insert(trial_id.to_string());
        }
    }
    Ok(done)
}

#[allow(clippy::too_many_arguments)]
async fn process_live_row(
    trial_id: &str,
    dataset: Option<&str>,
    args: &LiveArgs,
    config: &Arc<Config>,
    pubmed: &Arc<PubmedClient>,
    publications_store: &Store,
    llm: &Arc<LlmClient>,
    discovery_ctx: &crate::discovery::DiscoveryContext,
    strategies: &[Box<dyn crate::discovery::Strategy>],
) -> Result<(), PublinkError> {
    let registration = crate::registry::fetch(trial_id, args.local_registrations.as_deref()).await?;
    registration.validate()?;

    let (per_strategy, discovery_errors) = crate::discovery::run_all(&registration, discovery_ctx, strategies).await;
    let candidates = crate::discovery::enrich::dedup(per_strategy);
    let enriched = crate::discovery::enrich::enrich(
        pubmed,
        publications_store,
        config.cache_ttl_for("publication"),
        candidates,
    )
    .await?;

    let cutoff = if args.validation_run {
        crate::orchestrator::validation_cutoff(dataset).to_string()
    } else {
        registration.completion_date.clone().unwrap_or_default()
    };
    let max_filtered = crate::discovery::filters::max_date_filter(enriched, &cutoff);
    let min_filtered = crate::discovery::filters::min_date_filter(max_filtered.eligible, registration.start_date.as_deref());

    let mut classifications = std::collections::BTreeMap::new();
    for publication in &min_filtered.eligible {
        let classification = crate::classifier::classify(llm, config, &registration, publication).await;
        classifications.insert(publication.pmid.clone(), classification);
    }

    let mut summary = crate::output::summarize(&registration, &min_filtered.eligible, &discovery_errors, &classifications);
    // Live runs drop the `reasons` column from the tabular/sidecar summary;
    // the full per-pmid `reason` is still in `classifications` above.
    summary.reasons.clear();
    crate::output::write_trial_sidecar(&args.output_dir, &registration, &min_filtered.eligible, &min_filtered.filtered, &classifications, &summary).await?;
    crate::output::append_csv_row(&args.output_dir.join("summary.csv"), &summary)?;
    Ok(())
}

async fn run_health(apis_only: bool, json: bool) -> Result<(), PublinkError> {
    let report = health::check(apis_only).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report).map_err(|source| PublinkError::CacheDecode { path: "health-report".into(), source })?);
    } else {
        print!("{}", report.to_markdown());
    }
    if !report.all_healthy() {
        warn!("one or more dependencies are unhealthy");
    }
    Ok(())
}

async fn run_progress_show(output_dir: &std::path::Path, json: bool) -> Result<(), PublinkError> {
    let progress = Progress::load_or_new(output_dir, PathBuf::new()).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&progress).map_err(|source| PublinkError::CacheDecode { path: "progress.json".into(), source })?
        );
        return Ok(());
    }

    println!("stage: {:?}", progress.stage);
    println!("trials: {}", progress.trial_ids.len());
    println!("registrations fetched: {}", progress.registrations.len());
    let success = progress.rows.values().filter(|r| r.status == RowStatus::Success).count();
    let error = progress.rows.values().filter(|r| r.status == RowStatus::Error).count();
    println!("rows: {success} success, {error} error, {} total", progress.rows.len());
    println!("skipped (no trial id): {}", progress.skipped_counts.no_trial_id);
    println!("skipped (no registration): {}", progress.skipped_counts.no_registration);
    if progress.stage != Stage::Complete {
        println!("resume with: publink batch --input {} --output-dir {}", progress.input.display(), output_dir.display());
    }
    Ok(())
}
