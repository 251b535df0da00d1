//! Driver backed by spider.cloud: pages come back as markdown, the pager is
//! a `{page}` placeholder in the target URL, and records are pulled out with
//! a regex whose named groups are the field names.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use super::{Page, SourceDriver};
use crate::error::SourceError;
use crate::record::RawRecord;

const PAGE_PLACEHOLDER: &str = "{page}";
const READY_POLL_MS: u64 = 500;

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

pub struct SpiderDriver {
    spider: Arc<Spider>,
}

impl SpiderDriver {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| anyhow::anyhow!("SPIDER_API_KEY environment variable must be set"))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
        Ok(SpiderDriver {
            spider: Arc::new(spider),
        })
    }
}

#[async_trait]
impl SourceDriver for SpiderDriver {
    async fn open(&self) -> Result<Box<dyn Page>, SourceError> {
        Ok(Box::new(SpiderPage {
            spider: Arc::clone(&self.spider),
            url: String::new(),
            page_no: 1,
            pages: Vec::new(),
            exhausted: false,
            patterns: HashMap::new(),
        }))
    }
}

struct SpiderPage {
    spider: Arc<Spider>,
    url: String,
    page_no: u32,
    // Markdown of every page revealed so far, in order.
    pages: Vec<String>,
    exhausted: bool,
    patterns: HashMap<String, Option<Regex>>,
}

impl SpiderPage {
    fn page_url(&self, page_no: u32) -> String {
        self.url.replace(PAGE_PLACEHOLDER, &page_no.to_string())
    }

    fn paged(&self) -> bool {
        self.url.contains(PAGE_PLACEHOLDER)
    }

    fn content(&self) -> String {
        self.pages.join("\n\n")
    }

    fn pattern(&mut self, source: &str) -> Option<&Regex> {
        self.patterns
            .entry(source.to_string())
            .or_insert_with(|| match Regex::new(source) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Bad pattern {:?}: {}", source, e);
                    None
                }
            })
            .as_ref()
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };
        let started = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| e.to_string())?;
        debug!("Fetched {} in {}ms", url, started.elapsed().as_millis());

        let markdown = markdown_from_response(response)
            .ok_or_else(|| format!("no content in response for {}", url))?;
        Ok(markdown)
    }
}

#[async_trait]
impl Page for SpiderPage {
    async fn navigate(&mut self, target: &str) -> Result<(), SourceError> {
        self.url = target.to_string();
        self.page_no = 1;
        self.exhausted = false;
        let first = self.page_url(1);
        let markdown = self.fetch(&first).await.map_err(|reason| SourceError::Navigation {
            target: target.to_string(),
            reason,
        })?;
        self.pages = vec![markdown];
        Ok(())
    }

    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), SourceError> {
        let started = Instant::now();
        loop {
            let content = self.content();
            let ready = match self.pattern(selector) {
                Some(re) => re.is_match(&content),
                None => false,
            };
            if ready {
                return Ok(());
            }
            let left = timeout.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Err(SourceError::NotReady {
                    selector: selector.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(left.min(Duration::from_millis(READY_POLL_MS))).await;

            // Re-render the current page; content may still be loading.
            // The re-fetch only gets what is left of the deadline.
            let left = timeout.saturating_sub(started.elapsed());
            let url = self.page_url(self.page_no);
            match tokio::time::timeout(left, self.fetch(&url)).await {
                Ok(Ok(markdown)) => {
                    if let Some(last) = self.pages.last_mut() {
                        *last = markdown;
                    }
                }
                Ok(Err(e)) => debug!("Re-fetch while waiting failed: {}", e),
                Err(_) => debug!("Re-fetch of {} overran the readiness deadline", url),
            }
        }
    }

    async fn reveal_more(&mut self) -> Result<(), SourceError> {
        if !self.paged() || self.exhausted {
            return Ok(());
        }
        let next = self.page_no + 1;
        let url = self.page_url(next);
        let markdown = self.fetch(&url).await.map_err(SourceError::Interaction)?;
        if markdown.trim().is_empty() {
            debug!("Pager exhausted at page {} of {}", next, self.url);
            self.exhausted = true;
            return Ok(());
        }
        self.page_no = next;
        self.pages.push(markdown);
        Ok(())
    }

    async fn read_records(&mut self, extraction: &str) -> Vec<RawRecord> {
        let content = self.content();
        match self.pattern(extraction) {
            Some(re) => extract_records(re, &content),
            None => Vec::new(),
        }
    }

    async fn close(&mut self) {
        self.pages.clear();
    }
}

fn markdown_from_response(value: serde_json::Value) -> Option<String> {
    let parsed: serde_json::Value = match value.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
        None => value,
    };
    parsed
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(strip_images)
}

/// Remove markdown images: ![alt](url)
fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

/// One record per match; each named group becomes a field. Groups that did
/// not participate in a match come back as `None`.
fn extract_records(re: &Regex, content: &str) -> Vec<RawRecord> {
    let names: Vec<&str> = re.capture_names().flatten().collect();
    re.captures_iter(content)
        .map(|caps| {
            names
                .iter()
                .map(|name| {
                    let value = caps.name(name).map(|m| m.as_str().to_string());
                    (name.to_string(), value)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_named_groups() {
        let md = std::fs::read_to_string("tests/fixtures/answers.md").unwrap();
        let re = Regex::new(r"(?m)^### (?P<title>.+)\n\n(?:> (?P<answer>.+))?").unwrap();
        let recs = extract_records(&re, &md);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0]["title"].as_deref(), Some("How do I reset my router?"));
        assert_eq!(recs[0]["answer"].as_deref(), Some("Hold the button for ten seconds."));
        assert_eq!(recs[2]["answer"], None);
    }

    #[test]
    fn strips_images() {
        let md = "Intro\n\n![logo](https://x/logo.png)\n\n\n\nBody";
        assert_eq!(strip_images(md), "Intro\n\nBody");
    }

    #[test]
    fn reads_wrapped_response() {
        let inner = serde_json::json!([{ "content": "# Hi ![a](b)", "status": 200 }]);
        let wrapped = serde_json::Value::String(inner.to_string());
        assert_eq!(markdown_from_response(wrapped).as_deref(), Some("# Hi "));
        assert_eq!(markdown_from_response(serde_json::json!({})), None);
    }
}
