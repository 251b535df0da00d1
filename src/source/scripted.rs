//! Driver that replays a script instead of a browser: each opened page
//! plays the next session of record batches and failures.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{Page, SourceDriver};
use crate::error::SourceError;
use crate::record::RawRecord;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    pub sessions: Vec<Session>,
}

/// What one opened page does. Once the script runs out of sessions the
/// last one is replayed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub fail_navigate: bool,
    #[serde(default)]
    pub fail_ready: bool,
    /// The readiness wait hangs this long, ignoring its own timeout.
    #[serde(default)]
    pub stall_ready_ms: Option<u64>,
    #[serde(default)]
    pub rounds: Vec<ScriptedRound>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedRound {
    /// Visible set after this reveal.
    Records(Vec<RawRecord>),
    /// The reveal control fails with this message.
    Fail(String),
    /// The reveal hangs this many milliseconds before succeeding with
    /// nothing new on screen.
    StallMs(u64),
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid script {:?}", path))
    }
}

#[derive(Clone)]
pub struct ScriptedDriver {
    script: Arc<Script>,
    next_session: Arc<Mutex<usize>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        ScriptedDriver {
            script: Arc::new(script),
            next_session: Arc::new(Mutex::new(0)),
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_session(&self) -> Session {
        let mut next = match self.next_session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sessions = &self.script.sessions;
        let idx = (*next).min(sessions.len().saturating_sub(1));
        *next += 1;
        sessions.get(idx).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SourceDriver for ScriptedDriver {
    async fn open(&self) -> Result<Box<dyn Page>, SourceError> {
        let session = self.take_session();
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            session,
            cursor: None,
            visible: Vec::new(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct ScriptedPage {
    session: Session,
    cursor: Option<usize>,
    visible: Vec<RawRecord>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Page for ScriptedPage {
    async fn navigate(&mut self, target: &str) -> Result<(), SourceError> {
        if self.session.fail_navigate {
            return Err(SourceError::Navigation {
                target: target.to_string(),
                reason: "scripted navigation failure".into(),
            });
        }
        Ok(())
    }

    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), SourceError> {
        if let Some(ms) = self.session.stall_ready_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.session.fail_ready {
            return Err(SourceError::NotReady {
                selector: selector.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn reveal_more(&mut self) -> Result<(), SourceError> {
        let next = self.cursor.map_or(0, |c| c + 1);
        // Past the end of the script the page has nothing more to show.
        let Some(round) = self.session.rounds.get(next) else {
            return Ok(());
        };
        self.cursor = Some(next);
        match round {
            ScriptedRound::Records(records) => {
                self.visible = records.clone();
                Ok(())
            }
            ScriptedRound::Fail(msg) => Err(SourceError::Interaction(msg.clone())),
            ScriptedRound::StallMs(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
        }
    }

    async fn read_records(&mut self, _extraction: &str) -> Vec<RawRecord> {
        self.visible.clone()
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"{
        "sessions": [
            { "fail_navigate": true },
            { "rounds": [
                { "records": [ { "title": "A", "answer": "x" } ] },
                { "fail": "load more button gone" }
            ] }
        ]
    }"#;

    #[tokio::test]
    async fn sessions_play_in_order_then_repeat() {
        let script: Script = serde_json::from_str(SCRIPT).unwrap();
        let driver = ScriptedDriver::new(script);

        let mut first = driver.open().await.unwrap();
        assert!(matches!(
            first.navigate("t").await,
            Err(SourceError::Navigation { .. })
        ));
        first.close().await;

        for _ in 0..2 {
            let mut page = driver.open().await.unwrap();
            page.navigate("t").await.unwrap();
            page.reveal_more().await.unwrap();
            let recs = page.read_records("").await;
            assert_eq!(recs.len(), 1);
            assert_eq!(recs[0]["title"].as_deref(), Some("A"));
            assert!(matches!(
                page.reveal_more().await,
                Err(SourceError::Interaction(_))
            ));
            page.close().await;
        }

        assert_eq!(driver.opened(), 3);
        assert_eq!(driver.closed(), 3);
    }

    #[tokio::test]
    async fn exhausted_rounds_keep_last_view() {
        let script: Script = serde_json::from_str(
            r#"{ "sessions": [ { "rounds": [ { "records": [ { "title": "A" } ] } ] } ] }"#,
        )
        .unwrap();
        let driver = ScriptedDriver::new(script);
        let mut page = driver.open().await.unwrap();
        page.reveal_more().await.unwrap();
        page.reveal_more().await.unwrap();
        assert_eq!(page.read_records("").await.len(), 1);
    }
}
