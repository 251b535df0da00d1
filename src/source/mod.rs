//! The only contract with the page-automation layer. The pipeline opens a
//! page, drives it through these calls, and closes it again after every
//! attempt, whatever the outcome.

pub mod scripted;
pub mod spider;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::record::RawRecord;

/// Hands out fresh interactive pages.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Page>, SourceError>;
}

/// One live page, owned by a single scrape attempt.
#[async_trait]
pub trait Page: Send {
    async fn navigate(&mut self, target: &str) -> Result<(), SourceError>;

    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), SourceError>;

    /// One scroll or pager step.
    async fn reveal_more(&mut self) -> Result<(), SourceError>;

    /// Everything currently visible, including items returned by earlier
    /// reads. Best-effort: missing fields come back absent, never as errors.
    async fn read_records(&mut self, extraction: &str) -> Vec<RawRecord>;

    /// Release the page. Called exactly once, after which it is dropped.
    async fn close(&mut self);
}
