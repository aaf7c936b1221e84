//! Configuration management.
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML
//! file, then `IDENTITY_DEDUP_*` environment variables.

mod sections;

pub use sections::{
    DetectionConfig, LockConfig, LogFormat, LoggingConfig, MetricsConfig, ReconciliationConfig,
    ResolutionConfig, SearchConfig,
};

use crate::models::DuplicateRule;
use crate::services::Backoff;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix of the environment overrides.
pub const ENV_PREFIX: &str = "IDENTITY_DEDUP_";

const APP_DIR: &str = "identity-dedup";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// `SQLite` database holding suspicions, exclusions, rules and actions.
    pub database_path: PathBuf,
    /// JSON snapshot loaded into the reference identity store.
    pub identities_path: Option<PathBuf>,
    /// Client code attached to events and merges.
    pub client_code: String,
    /// Application name recorded as author of daemon mutations.
    pub author_name: String,
    /// Detection scanner settings.
    pub detection: DetectionConfig,
    /// Duplicate search retry settings.
    pub search: SearchConfig,
    /// Reconciliation settings.
    pub reconciliation: ReconciliationConfig,
    /// Resolution settings.
    pub resolution: ResolutionConfig,
    /// Suspicion lock settings.
    pub lock: LockConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Metrics settings.
    pub metrics: MetricsConfig,
    /// Rules upserted into the catalog at start-up.
    pub rules: Vec<DuplicateRule>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".identity-dedup/dedup.db"),
            identities_path: None,
            client_code: "identity-dedup".to_string(),
            author_name: "identity-dedup".to_string(),
            detection: DetectionConfig::default(),
            search: SearchConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            resolution: ResolutionConfig::default(),
            lock: LockConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl DedupConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid configuration.
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        toml::from_str(contents).map_err(|e| crate::Error::operation("parse_config_file", e))
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::operation("read_config_file", e))?;
        Self::from_toml(&contents)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir, then `~/.config/identity-dedup/`.
    /// Returns the default configuration if no readable file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join(APP_DIR).join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join(APP_DIR)
                .join("config.toml"),
        ];
        for path in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::default()
    }

    /// Applies `IDENTITY_DEDUP_*` overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`, keyed by full variable name.
    ///
    /// Reads:
    /// - `IDENTITY_DEDUP_DATABASE_PATH`, `IDENTITY_DEDUP_IDENTITIES_PATH`
    /// - `IDENTITY_DEDUP_CLIENT_CODE`, `IDENTITY_DEDUP_AUTHOR_NAME`
    /// - `IDENTITY_DEDUP_BATCH_SIZE`, `IDENTITY_DEDUP_PURGE_SIZE`
    /// - `IDENTITY_DEDUP_MAX_RETRY`, `IDENTITY_DEDUP_TEMPO_RETRY_MS`
    /// - `IDENTITY_DEDUP_RECONCILIATION_DELAY_SECS`
    /// - `IDENTITY_DEDUP_MIN_PIVOT_CERTIFICATION`, `IDENTITY_DEDUP_STRICT_RULE_CODE`
    /// - `IDENTITY_DEDUP_LOCK_DURATION_SECS`
    /// - `IDENTITY_DEDUP_LOG_LEVEL`, `IDENTITY_DEDUP_LOG_FORMAT`
    /// - `IDENTITY_DEDUP_METRICS_ENABLED`, `IDENTITY_DEDUP_METRICS_PORT`
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = var("IDENTITIES_PATH") {
            self.identities_path = Some(PathBuf::from(path));
        }
        if let Some(code) = var("CLIENT_CODE") {
            self.client_code = code;
        }
        if let Some(name) = var("AUTHOR_NAME") {
            self.author_name = name;
        }
        if let Some(size) = parse_var(var("BATCH_SIZE")) {
            self.detection.batch_size = size;
        }
        if let Some(size) = parse_var(var("PURGE_SIZE")) {
            self.detection.purge_size = size;
        }
        if let Some(retry) = parse_var(var("MAX_RETRY")) {
            self.search.max_retry = retry;
        }
        if let Some(tempo) = parse_var(var("TEMPO_RETRY_MS")) {
            self.search.tempo_retry_ms = tempo;
        }
        if let Some(backoff) = var("SEARCH_BACKOFF") {
            self.search.backoff = if backoff.eq_ignore_ascii_case("exponential") {
                Backoff::Exponential
            } else {
                Backoff::Fixed
            };
        }
        if let Some(delay) = parse_var(var("RECONCILIATION_DELAY_SECS")) {
            self.reconciliation.delay_secs = delay;
        }
        if let Some(level) = parse_var(var("MIN_PIVOT_CERTIFICATION")) {
            self.resolution.min_pivot_certification = level;
        }
        if let Some(code) = var("STRICT_RULE_CODE") {
            self.resolution.strict_rule_code = code;
        }
        if let Some(secs) = parse_var(var("LOCK_DURATION_SECS")) {
            self.lock.duration_secs = secs;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format);
        }
        if let Some(enabled) = var("METRICS_ENABLED") {
            self.metrics.enabled = matches!(
                enabled.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(port) = parse_var(var("METRICS_PORT")) {
            self.metrics.port = Some(port);
        }

        self
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Sets the identity snapshot path.
    #[must_use]
    pub fn with_identities_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identities_path = Some(path.into());
        self
    }
}

fn parse_var<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LimitationMode;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.search.max_retry, 3);
        assert_eq!(config.search.tempo_retry_ms, 1000);
        assert_eq!(config.resolution.min_pivot_certification, 500);
        assert_eq!(config.reconciliation.delay_secs, 30);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DedupConfig::from_toml(
            r#"
            database_path = "/tmp/dedup.db"

            [search]
            max_retry = 5
            backoff = "exponential"

            [[rules]]
            code = "EMAIL"
            priority = 1
            checked_attributes = ["email"]
            daemon = true
            detection_limit = 10
            limitation_mode = "INCREMENTAL"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.database_path, PathBuf::from("/tmp/dedup.db"));
        assert_eq!(config.search.max_retry, 5);
        assert_eq!(config.search.tempo_retry_ms, 1000);
        assert_eq!(config.search.backoff, Backoff::Exponential);
        assert_eq!(config.rules.len(), 1);
        assert!(config.rules[0].active);
        assert_eq!(config.rules[0].limitation_mode, LimitationMode::Incremental);
        assert_eq!(config.detection.batch_size, 100);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(DedupConfig::from_toml("search = 3").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "client_code = \"crm\"\n[lock]\nduration_secs = 60").expect("write");

        let config = DedupConfig::load_from_file(file.path()).expect("load");
        assert_eq!(config.client_code, "crm");
        assert_eq!(config.lock.duration_secs, 60);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<String, String> = [
            ("IDENTITY_DEDUP_MAX_RETRY", "7"),
            ("IDENTITY_DEDUP_BATCH_SIZE", "not-a-number"),
            ("IDENTITY_DEDUP_LOG_FORMAT", "JSON"),
            ("IDENTITY_DEDUP_METRICS_ENABLED", "true"),
            ("IDENTITY_DEDUP_IDENTITIES_PATH", "ids.json"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();

        let config = DedupConfig::default().with_overrides_from(|key| env.get(key).cloned());
        assert_eq!(config.search.max_retry, 7);
        assert_eq!(config.detection.batch_size, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.metrics.enabled);
        assert_eq!(config.identities_path, Some(PathBuf::from("ids.json")));
    }
}
