//! Runtime configuration for one archive run, and the optional TOML file that
//! supplies defaults.
//!
//! Precedence is command line, then config file, then the built-in defaults
//! below. [`ArchiveConfig::validate`] runs before any work starts.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::archive::{
    ArchiveSettings, DEFAULT_CDX_ENDPOINT, DEFAULT_RECENCY_START_YEAR, DEFAULT_REPLAY_BASE,
    SelectorConfig,
};
use crate::dedup::DEDUP_FILE_NAME;
use crate::fetch::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BURST, DEFAULT_REQUESTS_PER_SECOND, READ_TIMEOUT_SECS,
};
use crate::fetch::{
    BreakerSettings, DEFAULT_BASE_DELAY, DEFAULT_COOL_DOWN, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_USER_AGENT, FetchSettings, RetryPolicy,
};
use crate::manifest::{DEFAULT_AUTOSAVE_EVERY, MANIFEST_FILE_NAME};
use crate::queue::{DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS};

/// Highest accepted request rate.
const MAX_REQUESTS_PER_SECOND: f64 = 100.0;

/// Default posts per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Subdirectory of the output directory that holds media files.
pub const MEDIA_DIR_NAME: &str = "media";

/// Configuration problems detected before a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its accepted range.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Every knob of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveConfig {
    /// Name recorded in the manifest.
    pub source_name: String,
    /// Source URL recorded in the manifest.
    pub source_url: String,
    /// Root of the manifest, dedup side file and media directory.
    pub output_dir: PathBuf,
    /// Worker count.
    pub concurrency: usize,
    /// Sustained request rate shared by all workers.
    pub requests_per_second: f64,
    /// Token bucket capacity.
    pub burst: u32,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub read_timeout: Duration,
    /// User-Agent for every request.
    pub user_agent: String,
    /// Skip items already stored.
    pub resume: bool,
    /// Archive reblogged posts too.
    pub include_reblogs: bool,
    /// List and filter only; write nothing.
    pub dry_run: bool,
    /// Re-hash stored files instead of trusting the manifest.
    pub verify_on_resume: bool,
    /// Size and content-type mismatches fail the item.
    pub strict_verification: bool,
    /// Enables the circuit breaker.
    pub circuit_breaker: bool,
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    /// How long the breaker stays open.
    pub breaker_cool_down: Duration,
    /// Persist the dedup index next to the manifest.
    pub dedup_side_file: bool,
    /// Manifest autosave interval in media updates (0 disables).
    pub autosave_every: usize,
    /// Consult the archive when the source has lost an item.
    pub archive_fallback: bool,
    /// Also search archived post pages.
    pub page_fallback: bool,
    /// Capture index endpoint.
    pub cdx_endpoint: String,
    /// Replay host.
    pub replay_base: String,
    /// Recency bonus lower bound.
    pub recency_start_year: i32,
    /// Recency bonus upper bound; the current year when unset.
    pub recency_end_year: Option<i32>,
    /// Posts per listing page.
    pub page_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            source_name: String::new(),
            source_url: String::new(),
            output_dir: PathBuf::from("output"),
            concurrency: DEFAULT_WORKERS,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_DELAY,
            max_backoff: DEFAULT_MAX_DELAY,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            resume: true,
            include_reblogs: true,
            dry_run: false,
            verify_on_resume: false,
            strict_verification: false,
            circuit_breaker: false,
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_cool_down: DEFAULT_COOL_DOWN,
            dedup_side_file: true,
            autosave_every: DEFAULT_AUTOSAVE_EVERY,
            archive_fallback: true,
            page_fallback: true,
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            replay_base: DEFAULT_REPLAY_BASE.to_string(),
            recency_start_year: DEFAULT_RECENCY_START_YEAR,
            recency_end_year: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ArchiveConfig {
    /// Default config for one source.
    #[must_use]
    pub fn for_source(source_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_name.trim().is_empty() {
            return Err(ConfigError::invalid("source_name", "must not be empty"));
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.concurrency) {
            return Err(ConfigError::invalid(
                "concurrency",
                format!(
                    "{} is outside {MIN_WORKERS}..={MAX_WORKERS}",
                    self.concurrency
                ),
            ));
        }
        if !(self.requests_per_second > 0.0 && self.requests_per_second <= MAX_REQUESTS_PER_SECOND)
        {
            return Err(ConfigError::invalid(
                "requests_per_second",
                format!(
                    "{} must be greater than 0 and at most {MAX_REQUESTS_PER_SECOND}",
                    self.requests_per_second
                ),
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "base_backoff",
                "must not exceed max_backoff",
            ));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be at least one second"));
        }
        if self.circuit_breaker && self.breaker_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker_threshold",
                "must be at least 1",
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::invalid("page_size", "must be at least 1"));
        }
        if let Some(end) = self.recency_end_year {
            if end <= self.recency_start_year {
                return Err(ConfigError::invalid(
                    "recency_end_year",
                    format!("{end} must be after recency_start_year {}", self.recency_start_year),
                ));
            }
        }
        for (field, value) in [
            ("cdx_endpoint", &self.cdx_endpoint),
            ("replay_base", &self.replay_base),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::invalid(field, format!("'{value}' is not a URL")));
            }
        }
        Ok(())
    }

    /// Manifest file for this run.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }

    /// Directory media files are stored in.
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.output_dir.join(MEDIA_DIR_NAME)
    }

    /// Dedup side file, if enabled.
    #[must_use]
    pub fn dedup_path(&self) -> Option<PathBuf> {
        self.dedup_side_file
            .then(|| self.output_dir.join(DEDUP_FILE_NAME))
    }

    /// Fetch layer settings.
    #[must_use]
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            user_agent: self.user_agent.clone(),
            requests_per_second: self.requests_per_second,
            burst: self.burst,
            retry_policy: RetryPolicy::new(
                self.max_retries.saturating_add(1),
                self.base_backoff,
                self.max_backoff,
            ),
            circuit_breaker: self.circuit_breaker.then_some(BreakerSettings {
                failure_threshold: self.breaker_threshold,
                cool_down: self.breaker_cool_down,
            }),
        }
    }

    /// Archive client settings.
    #[must_use]
    pub fn archive_settings(&self) -> ArchiveSettings {
        let mut selector = SelectorConfig {
            recency_start_year: self.recency_start_year,
            ..SelectorConfig::default()
        };
        if let Some(end) = self.recency_end_year {
            selector.recency_end_year = end;
        }
        ArchiveSettings {
            cdx_endpoint: self.cdx_endpoint.clone(),
            replay_base: self.replay_base.clone(),
            selector,
            page_fallback: self.page_fallback,
            ..ArchiveSettings::default()
        }
    }
}

/// Optional defaults read from `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub requests_per_second: Option<f64>,
    pub burst: Option<u32>,
    pub max_retries: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub resume: Option<bool>,
    pub include_reblogs: Option<bool>,
    pub verify_on_resume: Option<bool>,
    pub strict_verification: Option<bool>,
    pub circuit_breaker: Option<bool>,
    pub breaker_threshold: Option<u32>,
    pub breaker_cool_down_secs: Option<u64>,
    pub dedup_side_file: Option<bool>,
    pub autosave_every: Option<usize>,
    pub archive_fallback: Option<bool>,
    pub page_fallback: Option<bool>,
    pub cdx_endpoint: Option<String>,
    pub replay_base: Option<String>,
    pub recency_start_year: Option<i32>,
    pub recency_end_year: Option<i32>,
    pub page_size: Option<usize>,
}

impl FileConfig {
    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the file at the default location, if there is one.
    ///
    /// # Errors
    ///
    /// Any error reading or parsing a file that exists.
    pub fn load_default() -> Result<Option<Self>, ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load(&path).map(Some),
            _ => Ok(None),
        }
    }

    /// Overwrites `config` with every value this file sets.
    pub fn apply_to(&self, config: &mut ArchiveConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &self.$field {
                    config.$field = value.clone();
                })*
            };
        }
        set!(
            output_dir,
            concurrency,
            requests_per_second,
            burst,
            max_retries,
            user_agent,
            resume,
            include_reblogs,
            verify_on_resume,
            strict_verification,
            circuit_breaker,
            breaker_threshold,
            dedup_side_file,
            autosave_every,
            archive_fallback,
            page_fallback,
            cdx_endpoint,
            replay_base,
            recency_start_year,
            page_size,
        );
        if let Some(ms) = self.base_backoff_ms {
            config.base_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = self.max_backoff_secs {
            config.max_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.breaker_cool_down_secs {
            config.breaker_cool_down = Duration::from_secs(secs);
        }
        if self.recency_end_year.is_some() {
            config.recency_end_year = self.recency_end_year;
        }
    }
}

/// Default config file location.
///
/// 1. `$XDG_CONFIG_HOME/media-archiver/config.toml`
/// 2. `$HOME/.config/media-archiver/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("media-archiver").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("media-archiver")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn valid() -> ArchiveConfig {
        ArchiveConfig::for_source("blog", "https://blog.example.com")
    }

    #[test]
    fn test_defaults_validate() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut ArchiveConfig)>)> = vec![
            ("concurrency", Box::new(|c| c.concurrency = 0)),
            ("concurrency", Box::new(|c| c.concurrency = 65)),
            ("requests_per_second", Box::new(|c| c.requests_per_second = 0.0)),
            ("requests_per_second", Box::new(|c| c.requests_per_second = f64::NAN)),
            ("burst", Box::new(|c| c.burst = 0)),
            ("source_name", Box::new(|c| c.source_name = " ".into())),
            ("cdx_endpoint", Box::new(|c| c.cdx_endpoint = "not a url".into())),
            ("recency_end_year", Box::new(|c| c.recency_end_year = Some(2000))),
        ];
        for (field, mutate) in cases {
            let mut config = valid();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected invalid {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_derived_paths() {
        let mut config = valid();
        config.output_dir = PathBuf::from("/data/blog");
        assert_eq!(config.manifest_path(), PathBuf::from("/data/blog/manifest.json"));
        assert_eq!(config.media_dir(), PathBuf::from("/data/blog/media"));
        assert_eq!(config.dedup_path(), Some(PathBuf::from("/data/blog/.dedup.json")));
        config.dedup_side_file = false;
        assert_eq!(config.dedup_path(), None);
    }

    #[test]
    fn test_fetch_settings_counts_first_attempt() {
        let mut config = valid();
        config.max_retries = 2;
        config.circuit_breaker = true;
        let settings = config.fetch_settings();
        assert_eq!(settings.retry_policy.max_attempts(), 3);
        assert_eq!(
            settings.circuit_breaker.unwrap().failure_threshold,
            DEFAULT_FAILURE_THRESHOLD
        );
    }

    #[test]
    fn test_file_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "concurrency = 8\nrequests_per_second = 0.5\ntimeout_secs = 10\nrecency_end_year = 2020\n",
        )
        .unwrap();

        let file = FileConfig::load(&path).unwrap();
        let mut config = valid();
        file.apply_to(&mut config);
        assert_eq!(config.concurrency, 8);
        assert!((config.requests_per_second - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.archive_settings().selector.recency_end_year, 2020);
        assert!(config.resume);
    }

    #[test]
    fn test_file_config_rejects_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "concurrancy = 8\n").unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
