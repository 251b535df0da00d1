//! Incremental record extraction from paginated, dynamically rendered
//! pages: reveal, read, validate, deduplicate, buffer, flush, with
//! whole-attempt retries when the page layer fails.

pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod round;
pub mod sink;
pub mod sitemap;
pub mod source;
pub mod target;

pub use error::{PipelineError, SinkError, SourceError};
pub use pipeline::{run_target, Outcome, PipelineContext, PipelineOptions, RunReport};
pub use record::{FieldSpec, RawRecord, Record, RecordSchema};
pub use target::{Budgets, Target};
