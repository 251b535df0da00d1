use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the page-automation layer. All of them are local to one
/// attempt: the scrape loop turns them into retry decisions.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not open source: {0}")]
    Open(String),
    #[error("navigation to '{target}' failed: {reason}")]
    Navigation { target: String, reason: String },
    #[error("'{selector}' not ready after {timeout_ms}ms")]
    NotReady { selector: String, timeout_ms: u64 },
    #[error("interaction failed: {0}")]
    Interaction(String),
}

/// A flush that could not reach the output store. The buffered records it
/// carried are gone; `lost` says how many.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("flush to {path:?} failed, {lost} buffered records lost: {source}")]
    Flush {
        path: PathBuf,
        lost: usize,
        #[source]
        source: io::Error,
    },
}

/// Errors a pipeline run hands back to its caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("invalid record schema: {0}")]
    Schema(String),
    #[error("pipeline context already used for '{0}'; create a new one per run")]
    ContextSpent(String),
}
