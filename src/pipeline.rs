//! Per-target pipeline: validator → dedup → buffered sink, driven by a
//! retry envelope around reveal/read rounds. Lifecycle is
//! `create → run(target) → close`; nothing is shared between contexts, so
//! several targets can run side by side.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupIndex;
use crate::error::{PipelineError, SinkError, SourceError};
use crate::record::RecordSchema;
use crate::retry::{AttemptState, RetryMachine};
use crate::round::ExtractionRound;
use crate::sink::BufferedSink;
use crate::source::{Page, SourceDriver};
use crate::target::Target;

/// Slack on top of `ready_timeout` before the pipeline stops waiting on a
/// driver that ignores its own deadline.
const READY_GRACE: Duration = Duration::from_millis(500);

/// Knobs a context needs besides the target itself.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub round: ExtractionRound,
    pub backoff: Duration,
    pub ready_timeout: Duration,
    pub buffer_capacity: usize,
    pub delimiter: u8,
    /// Handed to the driver's readiness wait.
    pub ready: String,
    /// Handed to the driver's record read.
    pub extract: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub rounds: u32,
    pub admitted: usize,
    pub duplicates: usize,
    /// Rows in the store once the context is closed.
    pub flushed: usize,
    pub output: PathBuf,
    pub last_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Why an attempt ended early.
enum AttemptError {
    Source(SourceError),
    Sink(SinkError),
}

impl From<SourceError> for AttemptError {
    fn from(e: SourceError) -> Self {
        AttemptError::Source(e)
    }
}

impl From<SinkError> for AttemptError {
    fn from(e: SinkError) -> Self {
        AttemptError::Sink(e)
    }
}

pub struct PipelineContext {
    schema: RecordSchema,
    options: PipelineOptions,
    dedup: DedupIndex,
    sink: BufferedSink,
    admitted: usize,
    duplicates: usize,
    rounds: u32,
    /// Label of the target this context ran, if any. A context runs once.
    ran: Option<String>,
    closed: bool,
}

impl PipelineContext {
    pub fn create(schema: RecordSchema, options: PipelineOptions, output: PathBuf) -> Self {
        let sink = BufferedSink::new(
            output,
            schema.field_names(),
            options.buffer_capacity,
            options.delimiter,
        );
        PipelineContext {
            schema,
            options,
            dedup: DedupIndex::new(),
            sink,
            admitted: 0,
            duplicates: 0,
            rounds: 0,
            ran: None,
            closed: false,
        }
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    pub fn buffered(&self) -> usize {
        self.sink.buffered()
    }

    /// Scrape one target until its record limit or round budget is reached,
    /// retrying whole attempts on page failures. Only a failed flush comes
    /// back as an error; exhausting retries is a `Failed` report.
    ///
    /// A context's counters and dedup index belong to one target, so a
    /// context that already ran or was closed refuses a second run.
    pub async fn run(
        &mut self,
        target: &Target,
        driver: &dyn SourceDriver,
    ) -> Result<RunReport, PipelineError> {
        if let Some(previous) = &self.ran {
            return Err(PipelineError::ContextSpent(previous.clone()));
        }
        if self.closed {
            return Err(PipelineError::ContextSpent(target.label.clone()));
        }
        self.ran = Some(target.label.clone());

        let mut machine = RetryMachine::new(target.budgets.retry_budget, self.options.backoff);
        let mut last_error: Option<String> = None;

        while !machine.state().is_terminal() {
            match machine.state() {
                AttemptState::Init => match driver.open().await {
                    Ok(mut page) => {
                        machine.begin_attempt();
                        let result = self.attempt(target, page.as_mut()).await;
                        page.close().await;
                        match result {
                            Ok(()) => machine.succeed(),
                            Err(AttemptError::Source(e)) => {
                                self.on_failure(target, &mut machine, &e);
                                last_error = Some(e.to_string());
                            }
                            Err(AttemptError::Sink(e)) => {
                                error!("Aborting {}: {}", target.label, e);
                                return Err(e.into());
                            }
                        }
                    }
                    Err(e) => {
                        self.on_failure(target, &mut machine, &e);
                        last_error = Some(e.to_string());
                    }
                },
                AttemptState::Retrying => {
                    if !machine.backoff().is_zero() {
                        tokio::time::sleep(machine.backoff()).await;
                    }
                    machine.resume();
                }
                AttemptState::Attempting | AttemptState::Succeeded | AttemptState::Failed => break,
            }
        }

        let outcome = if machine.state() == AttemptState::Succeeded {
            info!(
                "{}: {} records admitted in {} rounds, {} attempt(s)",
                target.label,
                self.admitted,
                self.rounds,
                machine.attempts()
            );
            Outcome::Succeeded
        } else {
            error!(
                "{}: giving up after {} attempts, {} records admitted ({})",
                target.url,
                machine.attempts(),
                self.admitted,
                last_error.as_deref().unwrap_or("unknown error")
            );
            Outcome::Failed
        };

        Ok(RunReport {
            target: target.label.clone(),
            outcome,
            attempts: machine.attempts(),
            rounds: self.rounds,
            admitted: self.admitted,
            duplicates: self.duplicates,
            flushed: self.sink.flushed(),
            output: self.sink.path().to_path_buf(),
            last_error,
            finished_at: Utc::now(),
        })
    }

    /// Flush whatever is still buffered. Safe to call more than once; only
    /// the first call writes.
    pub fn close(&mut self) -> Result<usize, SinkError> {
        if self.closed {
            return Ok(0);
        }
        self.closed = true;
        let n = self.sink.flush()?;
        if n > 0 {
            debug!("Final flush wrote {} rows to {:?}", n, self.sink.path());
        }
        Ok(n)
    }

    fn on_failure(&self, target: &Target, machine: &mut RetryMachine, e: &SourceError) {
        let next = machine.fail();
        if next == AttemptState::Retrying {
            warn!(
                "{}: attempt {} failed ({}), {} left, retrying in {:.1}s",
                target.label,
                machine.attempts(),
                e,
                machine.retries_left(),
                machine.backoff().as_secs_f64()
            );
        }
    }

    async fn attempt(&mut self, target: &Target, page: &mut dyn Page) -> Result<(), AttemptError> {
        let round = self.options.round;
        let action_timeout = round.action_timeout;

        match timeout(action_timeout, page.navigate(&target.url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SourceError::Navigation {
                    target: target.url.clone(),
                    reason: format!("timed out after {}ms", action_timeout.as_millis()),
                }
                .into())
            }
        }
        let ready_timeout = self.options.ready_timeout;
        match timeout(
            ready_timeout + READY_GRACE,
            page.wait_for_ready(&self.options.ready, ready_timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SourceError::NotReady {
                    selector: self.options.ready.clone(),
                    timeout_ms: ready_timeout.as_millis() as u64,
                }
                .into())
            }
        }

        let limit = target.budgets.record_limit;
        let mut rounds_tried = 0;
        while self.admitted < limit && rounds_tried < target.budgets.round_budget {
            let raw = round.run(page, &self.options.extract).await?;
            rounds_tried += 1;
            self.rounds += 1;

            let mut fresh = 0;
            for r in &raw {
                if self.admitted >= limit {
                    break;
                }
                let record = self.schema.validate(r);
                let key = self.schema.identity_key(&record);
                if self.dedup.is_duplicate(&key) {
                    self.duplicates += 1;
                    warn!("{}: duplicate record dropped ({:?})", target.label, key);
                    continue;
                }
                self.sink.add(record)?;
                self.admitted += 1;
                fresh += 1;
            }
            debug!(
                "{}: round {} read {} records, {} new, {} admitted so far",
                target.label,
                rounds_tried,
                raw.len(),
                fresh,
                self.admitted
            );
        }
        Ok(())
    }
}

/// Create a context, run the target, and close the context on every path.
/// A failed run still returns its report; a failed flush is the only error.
pub async fn run_target(
    schema: RecordSchema,
    options: PipelineOptions,
    output: PathBuf,
    target: &Target,
    driver: &dyn SourceDriver,
) -> Result<RunReport, PipelineError> {
    let mut ctx = PipelineContext::create(schema, options, output);
    let result = ctx.run(target, driver).await;
    let closed = ctx.close();

    let mut report = result?;
    closed?;
    report.flushed = ctx.sink.flushed();
    Ok(report)
}
