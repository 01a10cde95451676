//! Application configuration from the environment.
//!
//! [`AppConfig`] is built once at startup and handed to each component's
//! constructor. Parsing goes through a lookup function so tests can supply
//! their own environment.

use std::str::FromStr;
use std::time::Duration;

use crate::credentials::KeyPool;
use crate::pipeline::OrchestratorConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:reelforge.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Highest numbered `*_API_KEY_N` variable that is read.
const MAX_NUMBERED_KEYS: usize = 64;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,

    pub airtable_token: Option<String>,
    pub airtable_base_id: Option<String>,
    pub apify_token: Option<String>,

    pub fal_keys: KeyPool,
    pub wavespeed_keys: KeyPool,

    /// Jobs executing at once.
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_within_run: bool,
    pub stale_after: Duration,
    pub retention_days: u32,

    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            airtable_token: None,
            airtable_base_id: None,
            apify_token: None,
            fal_keys: KeyPool::new(Vec::new(), 1),
            wavespeed_keys: KeyPool::new(Vec::new(), 1),
            concurrency: 2,
            max_retries: 3,
            retry_within_run: true,
            stale_after: Duration::from_secs(7200),
            retention_days: 7,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_millis(60_000),
        }
    }
}

/// Collects every problem instead of stopping at the first.
struct Reader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&mut self, name: &str, default: T) -> T {
        match self.string(name) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                self.problems.push(format!("{name}: invalid value '{raw}'"));
                default
            }),
            None => default,
        }
    }

    fn flag(&mut self, name: &str, default: bool) -> bool {
        match self.string(name).map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                self.problems.push(format!("{name}: invalid boolean '{v}'"));
                default
            }
            None => default,
        }
    }

    /// `PREFIX_1..PREFIX_N`, falling back to the bare `PREFIX`.
    fn keys(&self, prefix: &str) -> Vec<String> {
        let numbered: Vec<String> = (1..=MAX_NUMBERED_KEYS)
            .filter_map(|i| self.string(&format!("{prefix}_{i}")))
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }
        self.string(prefix).into_iter().collect()
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut reader = Reader {
            lookup,
            problems: Vec::new(),
        };

        let fal_keys = KeyPool::new(
            reader.keys("FAL_API_KEY"),
            reader.parse("FAL_REQUESTS_PER_KEY", 1),
        );
        let wavespeed_keys = KeyPool::new(
            reader.keys("WAVESPEED_API_KEY"),
            reader.parse("WAVESPEED_REQUESTS_PER_KEY", 1),
        );

        let concurrency: usize = reader.parse("CONCURRENCY", defaults.concurrency);
        if concurrency == 0 {
            reader.problems.push("CONCURRENCY: must be at least 1".into());
        }
        let breaker_threshold: u32 =
            reader.parse("CIRCUIT_BREAKER_THRESHOLD", defaults.breaker_threshold);
        if breaker_threshold == 0 {
            reader
                .problems
                .push("CIRCUIT_BREAKER_THRESHOLD: must be at least 1".into());
        }

        let config = Self {
            database_url: reader
                .string("DATABASE_URL")
                .unwrap_or(defaults.database_url),
            log_dir: reader.string("LOG_DIR").unwrap_or(defaults.log_dir),
            airtable_token: reader.string("AIRTABLE_TOKEN"),
            airtable_base_id: reader.string("AIRTABLE_BASE_ID"),
            apify_token: reader.string("APIFY_TOKEN"),
            fal_keys,
            wavespeed_keys,
            concurrency,
            max_retries: reader.parse("MAX_RETRIES", defaults.max_retries),
            retry_within_run: reader.flag("RETRY_WITHIN_RUN", defaults.retry_within_run),
            stale_after: Duration::from_secs(
                reader.parse("STALE_JOB_SECS", defaults.stale_after.as_secs()),
            ),
            retention_days: reader.parse("RETENTION_DAYS", defaults.retention_days),
            breaker_threshold,
            breaker_cooldown: Duration::from_millis(reader.parse(
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                defaults.breaker_cooldown.as_millis() as u64,
            )),
        };

        if reader.problems.is_empty() {
            Ok(config)
        } else {
            Err(Error::config(reader.problems.join("; ")))
        }
    }

    /// Check the credentials a batch run needs. Maintenance commands skip
    /// this.
    pub fn validate_for_run(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.airtable_token.is_none() {
            problems.push("AIRTABLE_TOKEN is required");
        }
        if self.airtable_base_id.is_none() {
            problems.push("AIRTABLE_BASE_ID is required");
        }
        if self.apify_token.is_none() {
            problems.push("APIFY_TOKEN is required");
        }
        if self.fal_keys.is_empty() && self.wavespeed_keys.is_empty() {
            problems.push("at least one FAL_API_KEY or WAVESPEED_API_KEY is required");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::config(problems.join("; ")))
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries: self.max_retries,
            retry_within_run: self.retry_within_run,
            stale_after: self.stale_after,
            retention_days: Some(self.retention_days),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_retries, 3);
        assert!(config.retry_within_run);
        assert_eq!(config.stale_after, Duration::from_secs(7200));
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.breaker_cooldown, Duration::from_secs(60));
        assert!(config.fal_keys.is_empty());
        assert!(config.validate_for_run().is_err());
    }

    #[test]
    fn test_numbered_keys_take_precedence() {
        let config = load(&[
            ("FAL_API_KEY", "single"),
            ("FAL_API_KEY_1", "a"),
            ("FAL_API_KEY_2", "b"),
            ("FAL_API_KEY_4", "d"),
            ("FAL_REQUESTS_PER_KEY", "10"),
            ("WAVESPEED_API_KEY", "w"),
        ])
        .unwrap();
        assert_eq!(config.fal_keys.keys, vec!["a", "b", "d"]);
        assert_eq!(config.fal_keys.requests_per_key, 10);
        assert_eq!(config.wavespeed_keys.keys, vec!["w"]);
        assert_eq!(config.wavespeed_keys.requests_per_key, 1);
    }

    #[test]
    fn test_all_problems_are_reported() {
        let err = load(&[
            ("CONCURRENCY", "lots"),
            ("MAX_RETRIES", "-1"),
            ("RETRY_WITHIN_RUN", "maybe"),
        ])
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("CONCURRENCY"));
        assert!(message.contains("MAX_RETRIES"));
        assert!(message.contains("RETRY_WITHIN_RUN"));
    }

    #[test]
    fn test_validate_for_run() {
        let config = load(&[
            ("AIRTABLE_TOKEN", "pat"),
            ("AIRTABLE_BASE_ID", "app"),
            ("APIFY_TOKEN", "apify"),
            ("WAVESPEED_API_KEY", "w"),
            ("RETRY_WITHIN_RUN", "false"),
        ])
        .unwrap();
        assert!(!config.retry_within_run);
        config.validate_for_run().unwrap();
        assert!(!config.orchestrator_config().retry_within_run);
        assert_eq!(config.orchestrator_config().retention_days, Some(7));

        let missing = load(&[("AIRTABLE_TOKEN", "pat")]).unwrap();
        let message = missing.validate_for_run().unwrap_err().to_string();
        assert!(message.contains("AIRTABLE_BASE_ID"));
        assert!(message.contains("APIFY_TOKEN"));
        assert!(message.contains("FAL_API_KEY"));
    }
}
