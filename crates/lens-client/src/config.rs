use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use lens_api::BackendClientConfig;
use lens_cache::CachePolicy;
use lens_poller::PollSettings;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "lens.toml";
pub const DEFAULT_STATE_DIR: &str = ".lens";
pub const DEFAULT_TAB_ID: &str = "default";

const ENV_PREFIX: &str = "LENS_";

/// Client settings, layered as file defaults, then `LENS_*` environment
/// variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base: String,
    pub state_dir: PathBuf,
    pub tab_id: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub stale_time_ms: u64,
    pub retain_time_ms: u64,
    pub janitor_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let backend = BackendClientConfig::default();
        Self {
            api_base: backend.api_base,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            tab_id: DEFAULT_TAB_ID.to_string(),
            request_timeout_ms: backend.request_timeout_ms,
            retry_max_attempts: backend.retry_max_attempts,
            retry_base_delay_ms: backend.retry_base_delay_ms,
            stale_time_ms: 30_000,
            retain_time_ms: 300_000,
            janitor_interval_ms: 60_000,
            poll_interval_ms: 3_000,
            poll_timeout_ms: 600_000,
        }
    }
}

impl ClientConfig {
    /// Loads `path`, or the defaults when `path` is `None` and no
    /// `lens.toml` exists in the working directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(raw).context("invalid client config")?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Applies `LENS_*` overrides read through `lookup`. Blank, unparsable,
    /// and zero-valued numbers are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let positive = |key: &str| {
            text(key)
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|value| *value > 0)
        };

        if let Some(api_base) = text("API_BASE") {
            self.api_base = api_base;
        }
        if let Some(state_dir) = text("STATE_DIR") {
            self.state_dir = PathBuf::from(state_dir);
        }
        if let Some(tab_id) = text("TAB_ID") {
            self.tab_id = tab_id;
        }
        if let Some(value) = positive("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value;
        }
        if let Some(value) = positive("RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = usize::try_from(value).unwrap_or(usize::MAX);
        }
        if let Some(value) = positive("RETRY_BASE_DELAY_MS") {
            self.retry_base_delay_ms = value;
        }
        if let Some(value) = positive("STALE_TIME_MS") {
            self.stale_time_ms = value;
        }
        if let Some(value) = positive("RETAIN_TIME_MS") {
            self.retain_time_ms = value;
        }
        if let Some(value) = positive("JANITOR_INTERVAL_MS") {
            self.janitor_interval_ms = value;
        }
        if let Some(value) = positive("POLL_INTERVAL_MS") {
            self.poll_interval_ms = value;
        }
        if let Some(value) = positive("POLL_TIMEOUT_MS") {
            self.poll_timeout_ms = value;
        }
    }

    pub fn backend_config(&self) -> BackendClientConfig {
        BackendClientConfig {
            api_base: self.api_base.clone(),
            request_timeout_ms: self.request_timeout_ms,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            stale_time: Duration::from_millis(self.stale_time_ms),
            retain_time: Duration::from_millis(self.retain_time_ms.max(self.stale_time_ms)),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, time::Duration};

    use tempfile::tempdir;

    use super::ClientConfig;

    #[test]
    fn unit_partial_toml_keeps_defaults_for_missing_fields() {
        let config = ClientConfig::from_toml(
            r#"
api_base = "https://lens.example.com/api"
poll_interval_ms = 500
"#,
        )
        .expect("config");

        assert_eq!(config.api_base, "https://lens.example.com/api");
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.tab_id, ClientConfig::default().tab_id);
        assert_eq!(config.poll_settings().interval, Duration::from_millis(500));
    }

    #[test]
    fn regression_unknown_config_keys_are_rejected() {
        let error = ClientConfig::from_toml("api_bsae = \"typo\"").expect_err("unknown key");
        assert!(format!("{error:#}").contains("api_bsae"));
    }

    #[test]
    fn functional_env_overrides_apply_valid_values_and_ignore_invalid_ones() {
        let env = HashMap::from([
            ("LENS_API_BASE", " https://override.example.com "),
            ("LENS_STATE_DIR", "/tmp/lens-state"),
            ("LENS_STALE_TIME_MS", "1500"),
            ("LENS_POLL_TIMEOUT_MS", "not-a-number"),
            ("LENS_RETRY_MAX_ATTEMPTS", "0"),
            ("LENS_TAB_ID", "   "),
        ]);
        let mut config = ClientConfig::default();
        config.apply_overrides_from(|name| env.get(name).map(|value| value.to_string()));

        let defaults = ClientConfig::default();
        assert_eq!(config.api_base, "https://override.example.com");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/lens-state"));
        assert_eq!(config.stale_time_ms, 1_500);
        assert_eq!(config.poll_timeout_ms, defaults.poll_timeout_ms);
        assert_eq!(config.retry_max_attempts, defaults.retry_max_attempts);
        assert_eq!(config.tab_id, defaults.tab_id);
    }

    #[test]
    fn functional_load_reads_explicit_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("client.toml");
        std::fs::write(&path, "tab_id = \"tab-7\"\nretain_time_ms = 10\nstale_time_ms = 20\n")
            .expect("write config");

        let config = ClientConfig::from_file(&path).expect("load");
        assert_eq!(config.tab_id, "tab-7");
        assert_eq!(
            config.cache_policy().retain_time,
            Duration::from_millis(20),
            "retention never shorter than staleness"
        );
        assert!(ClientConfig::from_file(&temp.path().join("missing.toml")).is_err());
    }
}
