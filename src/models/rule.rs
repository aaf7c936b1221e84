//! Duplicate detection rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a rule's `detection_limit` is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LimitationMode {
    /// The limit bounds the suspicions already stored for the rule.
    #[default]
    Global,
    /// The limit bounds the suspicions created by a single scan.
    Incremental,
}

impl LimitationMode {
    /// Returns the stored name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Incremental => "INCREMENTAL",
        }
    }

    /// Parses a mode name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "GLOBAL" => Some(Self::Global),
            "INCREMENTAL" => Some(Self::Incremental),
            _ => None,
        }
    }
}

/// Configuration of one duplicate detection rule.
///
/// Rules are immutable for the duration of a run; only
/// `last_execution_date` is written back by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRule {
    /// Unique rule code.
    pub code: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Ordering key; lower values run first.
    #[serde(default)]
    pub priority: i32,
    /// Attributes an identity must carry to be checked by this rule.
    #[serde(default)]
    pub checked_attributes: Vec<String>,
    /// Maximum number of suspicions; 0 means unlimited.
    #[serde(default)]
    pub detection_limit: u32,
    /// How `detection_limit` is counted.
    #[serde(default)]
    pub limitation_mode: LimitationMode,
    /// Eligible for automatic scanning.
    #[serde(default)]
    pub daemon: bool,
    /// Rule is enabled.
    #[serde(default = "default_active")]
    pub active: bool,
    /// End of the last scanner pass.
    #[serde(default)]
    pub last_execution_date: Option<DateTime<Utc>>,
}

const fn default_active() -> bool {
    true
}

impl DuplicateRule {
    /// Creates an active, non-daemon rule with no limit.
    #[must_use]
    pub fn new(code: impl Into<String>, priority: i32, checked_attributes: &[&str]) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            priority,
            checked_attributes: checked_attributes.iter().map(ToString::to_string).collect(),
            detection_limit: 0,
            limitation_mode: LimitationMode::Global,
            daemon: false,
            active: true,
            last_execution_date: None,
        }
    }

    /// Marks the rule as eligible for automatic scanning.
    #[must_use]
    pub const fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Sets the detection limit and how it is counted.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32, mode: LimitationMode) -> Self {
        self.detection_limit = limit;
        self.limitation_mode = mode;
        self
    }

    /// Enables or disables the rule.
    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Returns true if the scanner should process this rule.
    #[must_use]
    pub const fn is_scannable(&self) -> bool {
        self.active && self.daemon
    }

    /// Returns true if the rule caps the number of suspicions.
    #[must_use]
    pub const fn is_limited(&self) -> bool {
        self.detection_limit > 0
    }

    /// Returns true if `count` suspicions reach the detection limit.
    #[must_use]
    pub fn limit_reached(&self, count: usize) -> bool {
        self.is_limited() && count >= self.detection_limit as usize
    }
}
