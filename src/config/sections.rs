//! Configuration sections.

use crate::services::Backoff;
use serde::Deserialize;
use std::path::PathBuf;

/// `[detection]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Identity ids fetched per page.
    pub batch_size: usize,
    /// Suspicions re-checked by the purge step.
    pub purge_size: usize,
    /// Seconds between two scans.
    pub interval_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            purge_size: 500,
            interval_secs: 3600,
        }
    }
}

/// `[search]` section: retry bound and delay of provider calls.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Attempts per search, first call included.
    pub max_retry: u32,
    /// Delay between attempts in milliseconds.
    pub tempo_retry_ms: u64,
    /// Delay growth between attempts.
    pub backoff: Backoff,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            tempo_retry_ms: 1000,
            backoff: Backoff::Fixed,
            backoff_factor: 2.0,
        }
    }
}

/// `[reconciliation]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Minimum age of an action before it is processed, in seconds.
    pub delay_secs: u64,
    /// Actions processed per run.
    pub batch_size: usize,
    /// Rules applied to created identities.
    pub creation_rules: Vec<String>,
    /// Rules applied to updated identities.
    pub update_rules: Vec<String>,
    /// Seconds between two runs.
    pub interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            delay_secs: 30,
            batch_size: 100,
            creation_rules: Vec::new(),
            update_rules: Vec::new(),
            interval_secs: 60,
        }
    }
}

/// `[resolution]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Rule whose suspicions are merged automatically.
    pub strict_rule_code: String,
    /// Minimum pivot certification of a connected primary.
    pub min_pivot_certification: u32,
    /// Identity-defining attributes.
    pub pivot_attributes: Vec<String>,
    /// Suspicions read per page; a run pages through every suspicion.
    pub batch_size: usize,
    /// Seconds between two runs.
    pub interval_secs: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            strict_rule_code: "STRICT".to_string(),
            min_pivot_certification: 500,
            pivot_attributes: ["family_name", "first_names", "birthdate", "gender"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            batch_size: 100,
            interval_secs: 600,
        }
    }
}

/// `[lock]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock lifetime in seconds.
    pub duration_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { duration_secs: 600 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, falling back to pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional log file; logs go to stderr otherwise.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// `[metrics]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Installs the Prometheus recorder.
    pub enabled: bool,
    /// Port of the scrape endpoint; no listener when unset.
    pub port: Option<u16>,
}
