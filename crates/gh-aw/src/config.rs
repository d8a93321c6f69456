//! Repository-level configuration (`.aw.toml`) and CLI override merging.
//!
//! The file is optional; every field has a default. CLI flags always win
//! over file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gh_aw_retry::RetryStrategyConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a human-readable string ("90d") or
/// an integer second count.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(secs) => Ok(Duration::from_secs(secs)),
    }
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn default_stale_after() -> Duration {
    // 90 days.
    Duration::from_secs(90 * 24 * 3600)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

/// `[compile]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompileConfig {
    /// Enforce strict-mode security policies by default.
    #[serde(default)]
    pub strict: bool,
    /// Directory to write lock files into (defaults to beside the source).
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// `[pins]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinsConfig {
    /// Age after which a cached pin warns and is re-resolved.
    #[serde(
        default = "default_stale_after",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub stale_after: Duration,
}

impl Default for PinsConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
        }
    }
}

/// `[watch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

/// Configuration loaded from `.aw.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AwConfig {
    #[serde(default)]
    pub compile: CompileConfig,

    #[serde(default)]
    pub pins: PinsConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// Backoff for remote fetches and pin resolution.
    #[serde(default)]
    pub retry: RetryStrategyConfig,
}

impl AwConfig {
    /// Load configuration; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<AwConfig> {
        if !path.exists() {
            return Ok(AwConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// CLI flags that override config-file values. `None` means "the user did
/// not pass this flag".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub strict: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub stale_after: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

impl AwConfig {
    /// Apply CLI overrides, consuming self.
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> AwConfig {
        if let Some(strict) = overrides.strict {
            self.compile.strict = strict;
        }
        if let Some(output_dir) = &overrides.output_dir {
            self.compile.output_dir = Some(output_dir.clone());
        }
        if let Some(stale_after) = overrides.stale_after {
            self.pins.stale_after = stale_after;
        }
        if let Some(poll_interval) = overrides.poll_interval {
            self.watch.poll_interval = poll_interval;
        }
        self
    }
}
