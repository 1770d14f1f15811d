//! Error taxonomy for loaders, pipelines and the benchmark loop.
//!
//! End of epoch is deliberately absent: it is a control signal carried by
//! [`crate::batch::BatchResult::EndOfEpoch`], never an error.

use thiserror::Error;

/// Errors surfaced by backends and the harness. None of them are retried.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Bad configuration, path, device or backend id.
    #[error("failed to initialise backend '{backend}': {reason}")]
    BackendInit { backend: String, reason: String },

    /// A batch or view was requested after the owning adapter released its handle.
    #[error("native loader handle used after release")]
    UseAfterRelease,

    /// Harness settings rejected before any backend is touched.
    #[error("invalid benchmark configuration: {0}")]
    InvalidConfig(String),

    /// `run()` was called before `build()`.
    #[error("pipeline '{0}' used before build()")]
    PipelineNotBuilt(String),

    /// Anything else raised by the pipeline or the native loader.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    /// Writing the report stream failed.
    #[error("report output error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    pub fn backend_init(backend: impl Into<String>, reason: impl ToString) -> Self {
        LoaderError::BackendInit {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
