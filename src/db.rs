use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::pipeline::RunReport;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS targets (
            id         INTEGER PRIMARY KEY,
            url        TEXT UNIQUE NOT NULL,
            profile    TEXT NOT NULL,
            visited    BOOLEAN NOT NULL DEFAULT 0,
            visited_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_targets_visited ON targets(visited);

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            target_id   INTEGER NOT NULL REFERENCES targets(id),
            label       TEXT NOT NULL,
            outcome     TEXT NOT NULL CHECK(outcome IN ('succeeded','failed')),
            attempts    INTEGER NOT NULL,
            rounds      INTEGER NOT NULL,
            admitted    INTEGER NOT NULL,
            duplicates  INTEGER NOT NULL,
            flushed     INTEGER NOT NULL,
            output      TEXT NOT NULL,
            error       TEXT,
            finished_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id);
        ",
    )?;
    Ok(())
}

// ── Queue ──

pub fn insert_targets(conn: &Connection, targets: &[(String, String)]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO targets (url, profile) VALUES (?1, ?2)")?;
        for (url, profile) in targets {
            count += stmt.execute(rusqlite::params![url, profile])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub struct PendingTarget {
    pub id: i64,
    pub url: String,
    pub profile: String,
}

pub fn fetch_pending(conn: &Connection, limit: Option<usize>) -> Result<Vec<PendingTarget>> {
    let sql = format!(
        "SELECT id, url, profile FROM targets WHERE visited = 0 ORDER BY id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PendingTarget {
                id: row.get(0)?,
                url: row.get(1)?,
                profile: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Ledger ──

/// Record a finished run and take its target off the queue.
pub fn save_run(conn: &Connection, target_id: i64, report: &RunReport) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO runs (target_id, label, outcome, attempts, rounds, admitted, duplicates,
                           flushed, output, error, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            target_id,
            report.target,
            report.outcome.as_str(),
            report.attempts,
            report.rounds,
            report.admitted as i64,
            report.duplicates as i64,
            report.flushed as i64,
            report.output.to_string_lossy().into_owned(),
            report.last_error,
            report.finished_at.to_rfc3339(),
        ],
    )?;
    tx.execute(
        "UPDATE targets SET visited = 1, visited_at = datetime('now') WHERE id = ?1",
        rusqlite::params![target_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// A run that never produced a report (its flush failed).
pub fn mark_aborted(conn: &Connection, target_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE targets SET visited = 1, visited_at = datetime('now') WHERE id = ?1",
        rusqlite::params![target_id],
    )?;
    Ok(())
}

pub struct Stats {
    pub total: i64,
    pub visited: i64,
    pub pending: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub records: i64,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let (total, visited): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(visited), 0) FROM targets",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (succeeded, failed, records): (i64, i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(outcome = 'succeeded'), 0),
                COALESCE(SUM(outcome = 'failed'), 0),
                COALESCE(SUM(admitted), 0)
         FROM runs",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(Stats {
        total,
        visited,
        pending: total - visited,
        succeeded,
        failed,
        records,
    })
}
