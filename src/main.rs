use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use rusqlite::Connection;
use tracing::{error, warn};

use harvester::config::Settings;
use harvester::source::scripted::{Script, ScriptedDriver};
use harvester::source::spider::SpiderDriver;
use harvester::source::SourceDriver;
use harvester::{db, run_target, sitemap, Outcome, RunReport, Target};

#[derive(Parser)]
#[command(name = "harvester", about = "Incremental record scraper for paginated pages")]
struct Cli {
    /// Config file (default: ./harvest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a sitemap and queue matching URLs as targets
    Seed {
        #[arg(long)]
        sitemap: String,
        /// Regex a URL must match to be queued
        #[arg(long, default_value = ".")]
        pattern: String,
        #[arg(short, long)]
        profile: String,
    },
    /// Queue targets by hand
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(short, long)]
        profile: String,
    },
    /// Scrape pending targets via spider.cloud
    Run {
        /// Max targets to run (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Run one target against a scripted page (JSON), no network
    Replay {
        #[arg(long)]
        script: PathBuf,
        #[arg(short, long)]
        profile: String,
        /// Output file (default: <output_dir>/<label>.csv)
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Queue and ledger summary
    Stats,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Seed {
            sitemap: url,
            pattern,
            profile,
        } => {
            settings.profile(&profile)?;
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let urls = sitemap::fetch_target_urls(&url, &pattern).await?;
            let rows: Vec<(String, String)> =
                urls.iter().map(|u| (u.clone(), profile.clone())).collect();
            let inserted = db::insert_targets(&conn, &rows)?;
            println!("Queued {} new targets ({} matched)", inserted, urls.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Add { urls, profile } => {
            settings.profile(&profile)?;
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let rows: Vec<(String, String)> =
                urls.into_iter().map(|u| (u, profile.clone())).collect();
            let inserted = db::insert_targets(&conn, &rows)?;
            println!("Queued {} new targets", inserted);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { limit } => run_pending(settings, limit).await,
        Commands::Replay {
            script,
            profile,
            out,
            label,
        } => {
            let driver = ScriptedDriver::new(Script::load(&script)?);
            let mut target = Target::new(&script.to_string_lossy(), &profile, settings.budgets());
            if let Some(label) = label {
                target = target.with_label(&label);
            }
            let output = out.unwrap_or_else(|| settings.output_path(&target));
            let report = run_target(
                settings.schema(&profile)?,
                settings.pipeline_options(&profile)?,
                output,
                &target,
                &driver,
            )
            .await?;
            print_report(&report);
            Ok(exit_code(&[report.outcome]))
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Targets:   {}", s.total);
            println!("Visited:   {}", s.visited);
            println!("Pending:   {}", s.pending);
            println!("Succeeded: {}", s.succeeded);
            println!("Failed:    {}", s.failed);
            println!("Records:   {}", s.records);
            Ok(ExitCode::SUCCESS)
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Run pending targets, each with its own context and output file, at most
/// `concurrency` at a time. Reports are written to the ledger as they land.
async fn run_pending(settings: Settings, limit: Option<usize>) -> Result<ExitCode> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    let pending = db::fetch_pending(&conn, limit)?;
    if pending.is_empty() {
        println!("No pending targets. Run 'seed' or 'add' first.");
        return Ok(ExitCode::SUCCESS);
    }

    let driver: Arc<dyn SourceDriver> = Arc::new(SpiderDriver::from_env()?);
    let settings = Arc::new(settings);
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let total = pending.len();
    println!("Running {} targets...", total);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(i64, Result<RunReport>)>(settings.concurrency * 2);

    for item in pending {
        let driver = Arc::clone(&driver);
        let settings = Arc::clone(&settings);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let result = run_one(&settings, &item.url, &item.profile, driver.as_ref()).await;
            let _ = tx.send((item.id, result)).await;
        });
    }

    // rx closes once every task has dropped its sender
    drop(tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some((target_id, result)) = rx.recv().await {
        if let Ok(report) = &result {
            pb.suspend(|| print_report(report));
        }
        outcomes.push(record_result(&conn, target_id, result));
        pb.inc(1);
    }
    pb.finish_and_clear();

    let failed = outcomes.iter().filter(|o| **o == Outcome::Failed).count();
    println!(
        "Ran {} targets ({} ok, {} failed)",
        outcomes.len(),
        outcomes.len() - failed,
        failed
    );
    Ok(exit_code(&outcomes))
}

/// Write one finished target to the ledger. A ledger write that fails is
/// logged and skipped: the target's output file is already on disk, and
/// the remaining targets still have to be drained.
fn record_result(conn: &Connection, target_id: i64, result: Result<RunReport>) -> Outcome {
    let (outcome, written) = match result {
        Ok(report) => (report.outcome, db::save_run(conn, target_id, &report)),
        Err(e) => {
            warn!("Target {} aborted: {:#}", target_id, e);
            (Outcome::Failed, db::mark_aborted(conn, target_id))
        }
    };
    if let Err(e) = written {
        error!("Could not record target {} in the ledger: {:#}", target_id, e);
    }
    outcome
}

async fn run_one(
    settings: &Settings,
    url: &str,
    profile: &str,
    driver: &dyn SourceDriver,
) -> Result<RunReport> {
    let target = Target::new(url, profile, settings.budgets());
    let output = settings.output_path(&target);
    let report = run_target(
        settings.schema(profile)?,
        settings.pipeline_options(profile)?,
        output,
        &target,
        driver,
    )
    .await
    .with_context(|| format!("Run of {} aborted", url))?;
    Ok(report)
}

fn print_report(r: &RunReport) {
    match r.outcome {
        Outcome::Succeeded => println!(
            "{}: {} records -> {}",
            r.target,
            r.admitted,
            r.output.display()
        ),
        Outcome::Failed => println!(
            "{}: FAILED after {} attempts, {} records captured in {} ({})",
            r.target,
            r.attempts,
            r.admitted,
            r.output.display(),
            r.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn exit_code(outcomes: &[Outcome]) -> ExitCode {
    if outcomes.iter().any(|o| *o == Outcome::Failed) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
