//! Error taxonomy shared by the pipeline stages.
//!
//! Only [`PipelineError::Config`] is fatal to the process. Every other
//! variant is either fatal to the current cycle (`SourceUnavailable`,
//! `Index`) or recovered per record / per request (`Transform`, `Delivery`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Archive or realtime feed could not be fetched or extracted.
    #[error("source unavailable during {phase} ({source_id}): {message}")]
    SourceUnavailable {
        source_id: String,
        phase: &'static str,
        message: String,
    },

    /// A single record could not be versioned or serialized.
    #[error("transform error: {0}")]
    Transform(String),

    /// The sink rejected a payload.
    #[error("sink responded with HTTP {status} for {target}")]
    DeliveryStatus { status: u16, target: String },

    /// The sink could not be reached.
    #[error("transport error while posting to {target}: {message}")]
    DeliveryTransport { target: String, message: String },

    /// Invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// HistoryStore failure.
    #[error("history store error: {0}")]
    Store(String),

    /// Static data present but unreadable while building indexes.
    #[error("index build failed: {0}")]
    Index(String),

    /// A blocking or spawned stage panicked or was cancelled.
    #[error("pipeline task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn source_unavailable(
        source_id: impl Into<String>,
        phase: &'static str,
        err: impl std::fmt::Display,
    ) -> Self {
        PipelineError::SourceUnavailable {
            source_id: source_id.into(),
            phase,
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Store(format!("invalid JSON value: {e}"))
    }
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        PipelineError::Index(e.to_string())
    }
}
