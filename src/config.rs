use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::pipeline::PipelineOptions;
use crate::record::{FieldSpec, RecordSchema};
use crate::round::{ExtractionRound, SettleWindow};
use crate::target::{Budgets, Target};

const DEFAULTS: &str = include_str!("../harvest.default.toml");
const LOCAL_CONFIG: &str = "harvest.toml";

/// Operator parameters. Layered: built-in defaults, then `harvest.toml`
/// (or an explicit file), then `HARVEST_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub record_limit: usize,
    pub round_budget: u32,
    pub retry_budget: u32,
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
    pub backoff_ms: u64,
    pub ready_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub buffer_capacity: usize,
    pub output_dir: PathBuf,
    pub delimiter: String,
    pub concurrency: usize,
    pub db_path: PathBuf,
    pub profiles: HashMap<String, Profile>,
}

/// A record kind: its fields, which of them identify a record, and the
/// descriptors handed to the page driver.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub fields: Vec<FieldSpec>,
    pub identity: Vec<String>,
    pub ready: String,
    pub extract: String,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml));
        builder = match path {
            Some(p) => builder.add_source(File::from(p).required(true)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG).required(false)),
        };
        let settings: Settings = builder
            .add_source(Environment::with_prefix("HARVEST").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults with overrides from a TOML string, no files or environment.
    pub fn from_toml(overrides: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.settle_min_ms > self.settle_max_ms {
            bail!(
                "settle_min_ms ({}) exceeds settle_max_ms ({})",
                self.settle_min_ms,
                self.settle_max_ms
            );
        }
        if self.buffer_capacity == 0 {
            bail!("buffer_capacity must be at least 1");
        }
        if self.retry_budget == 0 {
            bail!("retry_budget must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        self.delimiter_byte()?;
        for (name, profile) in &self.profiles {
            RecordSchema::new(profile.fields.clone(), &profile.identity)
                .with_context(|| format!("Profile '{}'", name))?;
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        let d = match self.delimiter.as_str() {
            "\\t" | "tab" => "\t",
            other => other,
        };
        match d.as_bytes() {
            [b] if b.is_ascii() && *b != b'"' && *b != b'\n' && *b != b'\r' => Ok(*b),
            _ => bail!("delimiter must be one ASCII character, got {:?}", self.delimiter),
        }
    }

    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            known.sort();
            anyhow!("Unknown profile '{}' (known: {})", name, known.join(", "))
        })
    }

    pub fn schema(&self, profile: &str) -> Result<RecordSchema> {
        let p = self.profile(profile)?;
        Ok(RecordSchema::new(p.fields.clone(), &p.identity)?)
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            record_limit: self.record_limit,
            round_budget: self.round_budget,
            retry_budget: self.retry_budget,
        }
    }

    pub fn round(&self) -> ExtractionRound {
        ExtractionRound::new(
            SettleWindow::new(self.settle_min_ms, self.settle_max_ms),
            Duration::from_millis(self.action_timeout_ms),
        )
    }

    pub fn pipeline_options(&self, profile: &str) -> Result<PipelineOptions> {
        let p = self.profile(profile)?;
        Ok(PipelineOptions {
            round: self.round(),
            backoff: Duration::from_millis(self.backoff_ms),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            buffer_capacity: self.buffer_capacity,
            delimiter: self.delimiter_byte()?,
            ready: p.ready.clone(),
            extract: p.extract.clone(),
        })
    }

    pub fn output_path(&self, target: &Target) -> PathBuf {
        let ext = if self.delimiter_byte().ok() == Some(b'\t') {
            "tsv"
        } else {
            "csv"
        };
        self.output_dir.join(format!("{}.{}", target.label, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.retry_budget, 3);
        assert_eq!(s.delimiter_byte().unwrap(), b',');
        for name in ["reviews", "answers", "results"] {
            assert!(s.schema(name).is_ok(), "{}", name);
        }
        assert!(s.profile("nope").is_err());
    }

    #[test]
    fn overrides_apply() {
        let s = Settings::from_toml("buffer_capacity = 2\ndelimiter = 'tab'\nrecord_limit = 5").unwrap();
        assert_eq!(s.buffer_capacity, 2);
        assert_eq!(s.budgets().record_limit, 5);
        let t = Target::new("https://x.test/a", "answers", s.budgets());
        let name = s.output_path(&t).file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("x-test-a-") && name.ends_with(".tsv"), "{}", name);
    }

    #[test]
    fn long_urls_with_a_shared_prefix_get_separate_files() {
        let s = Settings::from_toml("").unwrap();
        let stem = format!("https://shop.test/{}", "deep/".repeat(20));
        let a = Target::new(&format!("{}one", stem), "answers", s.budgets());
        let b = Target::new(&format!("{}two", stem), "answers", s.budgets());
        assert_ne!(s.output_path(&a), s.output_path(&b));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Settings::from_toml("settle_min_ms = 10\nsettle_max_ms = 5").is_err());
        assert!(Settings::from_toml("buffer_capacity = 0").is_err());
        assert!(Settings::from_toml("delimiter = ';;'").is_err());
        assert!(Settings::from_toml(
            "[profiles.bad]\nidentity = []\nready = 'x'\nextract = 'x'\nfields = [{ name = 'a' }]"
        )
        .is_err());
    }

    #[test]
    fn profile_regexes_compile() {
        let s = Settings::from_toml("").unwrap();
        for p in s.profiles.values() {
            regex::Regex::new(&p.ready).unwrap();
            regex::Regex::new(&p.extract).unwrap();
        }
    }
}
