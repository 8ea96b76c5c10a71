use thiserror::Error;

/// Leaf error type shared by every layer of the pipeline. Orchestrator
/// stages capture these per unit of work (row, strategy, chunk) rather
/// than letting most of them abort a whole run; see `OrchestratorError`
/// for the handful of variants that are fatal.
#[derive(Debug, Error)]
pub enum PublinkError {
    #[error("{api}: {message}")]
    Api { api: String, message: String },

    #[error("{api} returned invalid JSON: {source}")]
    ApiJson {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{entity} not found: {id}{}", suggestion.as_ref().map(|s| format!(" ({s})")).unwrap_or_default())]
    NotFound {
        entity: String,
        id: String,
        suggestion: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not determine registry for trial id: {0}")]
    UnknownRegistry(String),

    #[error("cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("cache entry at {path} was not valid JSON: {source}")]
    CacheDecode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("LLM batch job {batch_id} entered a terminal failure status: {status}")]
    LlmBatchFailed { batch_id: String, status: String },

    #[error(
        "daily token budget exhausted: used {used}, next chunk needs {needed}, budget is {budget}"
    )]
    DailyBudgetExhausted {
        used: u64,
        needed: u64,
        budget: u64,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    HttpMiddleware(#[from] reqwest_middleware::Error),
}

impl PublinkError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}
