use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;

use crate::error::SourceError;
use crate::record::RawRecord;
use crate::source::Page;

/// Pause after each reveal, drawn uniformly from `[min_ms, max_ms]`.
#[derive(Debug, Clone, Copy)]
pub struct SettleWindow {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl SettleWindow {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        SettleWindow {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn sample(&self) -> Duration {
        if self.min_ms == self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

/// One reveal-then-read step against a page. Every page call is bounded by
/// `action_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRound {
    pub settle: SettleWindow,
    pub action_timeout: Duration,
}

impl ExtractionRound {
    pub fn new(settle: SettleWindow, action_timeout: Duration) -> Self {
        ExtractionRound {
            settle,
            action_timeout,
        }
    }

    pub async fn reveal(&self, page: &mut dyn Page) -> Result<(), SourceError> {
        match timeout(self.action_timeout, page.reveal_more()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SourceError::Interaction(format!(
                    "reveal timed out after {}ms",
                    self.action_timeout.as_millis()
                )))
            }
        }
        let pause = self.settle.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    /// Re-reads the whole visible set; callers filter repeats.
    pub async fn read_visible(
        &self,
        page: &mut dyn Page,
        extraction: &str,
    ) -> Result<Vec<RawRecord>, SourceError> {
        timeout(self.action_timeout, page.read_records(extraction))
            .await
            .map_err(|_| {
                SourceError::Interaction(format!(
                    "read timed out after {}ms",
                    self.action_timeout.as_millis()
                ))
            })
    }

    pub async fn run(
        &self,
        page: &mut dyn Page,
        extraction: &str,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.reveal(page).await?;
        self.read_visible(page, extraction).await
    }
}
