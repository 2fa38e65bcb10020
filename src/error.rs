use thiserror::Error;

/// Error taxonomy for the sweep. Workers use `anyhow` internally for
/// context-rich failures; the orchestrator wraps them into `Worker` at the
/// boundary and decides retry/skip/abort.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Caller misuse: unknown axis value, malformed date, bad config.
    /// Surfaced at the boundary, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Persistence failure (schema mismatch, locked/corrupt database).
    /// Fatal for the run.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Input-data problem for a single instrument; recovered locally.
    #[error("no usable bar data for {instrument}: {reason}")]
    Data { instrument: String, reason: String },

    /// Unexpected failure inside a worker task. The instrument is rolled
    /// back to pending and the run continues.
    #[error("worker failed on {instrument}")]
    Worker {
        instrument: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("interrupted by user")]
    Interrupted,
}

impl SweepError {
    pub fn config(msg: impl Into<String>) -> Self {
        SweepError::Config(msg.into())
    }
}

pub type Result<T, E = SweepError> = std::result::Result<T, E>;
