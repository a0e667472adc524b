use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chat::{DEFAULT_MODEL, ModelAliases, default_aliases};
use crate::credential::{DEFAULT_KEYS_ENV, KeyPool};
use crate::dispatch::Dispatcher;
use crate::env::Env;
use crate::relay::RelayLimits;
use crate::rotation::{FileRotationCounter, MemoryRotationCounter, RotationCounter};
use crate::selector::KeySelector;
use crate::service::RelayService;
use crate::upstream::{DEFAULT_BASE_URL, GeminiClient};
use crate::{RelayError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationBackend {
    /// Counter file shared by every process using the same `data_dir`.
    #[default]
    File,
    /// Per-process counter.
    Memory,
}

/// Non-secret settings. Keys come from the environment, never from here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: String,
    pub keys_env: String,
    pub data_dir: PathBuf,
    pub counter_file: String,
    pub rotation: RotationBackend,
    pub base_url: String,
    pub attempt_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// `0` disables the idle timeout.
    pub stream_idle_timeout_seconds: u64,
    /// `0` disables the cap.
    pub max_consecutive_malformed_chunks: usize,
    pub max_upload_bytes: usize,
    pub default_model: String,
    pub model_aliases: BTreeMap<String, String>,
    pub json_logs: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            keys_env: DEFAULT_KEYS_ENV.to_string(),
            data_dir: PathBuf::from("temp_data"),
            counter_file: "key_counter.txt".to_string(),
            rotation: RotationBackend::File,
            base_url: DEFAULT_BASE_URL.to_string(),
            attempt_timeout_seconds: 120,
            connect_timeout_seconds: 10,
            stream_idle_timeout_seconds: 120,
            max_consecutive_malformed_chunks: 64,
            max_upload_bytes: 20 * 1024 * 1024,
            default_model: DEFAULT_MODEL.to_string(),
            model_aliases: default_aliases(),
            json_logs: false,
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RelayError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keys_env.trim().is_empty() {
            return Err(RelayError::Config("keys_env must not be empty".to_string()));
        }
        if self.counter_file.trim().is_empty() {
            return Err(RelayError::Config(
                "counter_file must not be empty".to_string(),
            ));
        }
        if self.attempt_timeout_seconds == 0 {
            return Err(RelayError::Config(
                "attempt_timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err(RelayError::Config(
                "default_model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `listen`, with its port replaced by `PORT` when that is set.
    pub fn listen_addr(&self, env: &Env) -> Result<String> {
        let Some(port) = env.get("PORT") else {
            return Ok(self.listen.clone());
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| RelayError::Config(format!("invalid PORT: {port}")))?;
        let host = self
            .listen
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.listen.as_str());
        Ok(format!("{host}:{port}"))
    }

    /// Missing, blank or all-blank key lists are fatal at startup.
    pub fn resolve_pool(&self, env: &Env) -> Result<KeyPool> {
        let raw = env.get(&self.keys_env).ok_or_else(|| {
            RelayError::Config(format!("environment variable {} is not set", self.keys_env))
        })?;
        KeyPool::load(&raw)
    }

    pub fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            max_consecutive_malformed: self.max_consecutive_malformed_chunks,
            idle_timeout: (self.stream_idle_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.stream_idle_timeout_seconds)),
        }
    }

    pub fn model_aliases(&self) -> ModelAliases {
        ModelAliases::new(self.default_model.trim(), self.model_aliases.clone())
    }

    pub fn build_counter(&self) -> Result<Arc<dyn RotationCounter>> {
        Ok(match self.rotation {
            RotationBackend::File => {
                Arc::new(FileRotationCounter::open(&self.data_dir, &self.counter_file)?)
            }
            RotationBackend::Memory => Arc::new(MemoryRotationCounter::default()),
        })
    }

    pub fn build_client(&self) -> Result<GeminiClient> {
        Ok(GeminiClient::new(
            Duration::from_secs(self.attempt_timeout_seconds),
            Duration::from_secs(self.connect_timeout_seconds),
        )?
        .with_base_url(self.base_url.clone()))
    }

    pub fn build_service(&self, pool: KeyPool) -> Result<RelayService> {
        let selector = KeySelector::new(pool, self.build_counter()?);
        let dispatcher = Dispatcher::new(self.build_client()?);
        Ok(RelayService::new(selector, dispatcher)
            .with_aliases(self.model_aliases())
            .with_limits(self.relay_limits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() -> Result<()> {
        let config = RelayConfig::from_toml_str("")?;
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.data_dir, PathBuf::from("temp_data"));
        assert_eq!(config.rotation, RotationBackend::File);
        Ok(())
    }

    #[test]
    fn parses_overrides() -> Result<()> {
        let config = RelayConfig::from_toml_str(
            r#"
listen = "127.0.0.1:9000"
rotation = "memory"
stream_idle_timeout_seconds = 0
max_consecutive_malformed_chunks = 5

[model_aliases]
fast = "gemini-1.5-flash-8b"
"#,
        )?;
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.rotation, RotationBackend::Memory);
        assert_eq!(config.relay_limits().idle_timeout, None);
        assert_eq!(config.relay_limits().max_consecutive_malformed, 5);
        assert_eq!(
            config.model_aliases().resolve(Some("fast")),
            "gemini-1.5-flash-8b"
        );
        // An explicit table replaces the built-in aliases.
        assert_eq!(
            config.model_aliases().resolve(Some("gemini-2.5-pro")),
            "gemini-2.5-pro"
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(matches!(
            RelayConfig::from_toml_str("api_keys = \"k\"").unwrap_err(),
            RelayError::Toml(_)
        ));
        assert!(matches!(
            RelayConfig::from_toml_str("attempt_timeout_seconds = 0").unwrap_err(),
            RelayError::Config(_)
        ));
    }

    #[test]
    fn port_variable_replaces_listen_port() -> Result<()> {
        let config = RelayConfig::default();
        assert_eq!(
            config.listen_addr(&Env::parse_dotenv("PORT=8080\n"))?,
            "0.0.0.0:8080"
        );
        assert!(matches!(
            config.listen_addr(&Env::parse_dotenv("PORT=http\n")).unwrap_err(),
            RelayError::Config(_)
        ));
        Ok(())
    }

    #[test]
    fn resolves_pool_from_configured_variable() -> Result<()> {
        let config = RelayConfig {
            keys_env: "GEMINI_RELAY_TEST_POOL".to_string(),
            ..RelayConfig::default()
        };
        let pool = config.resolve_pool(&Env::parse_dotenv("GEMINI_RELAY_TEST_POOL=a, b,,c\n"))?;
        assert_eq!(pool.len(), 3);

        let missing = RelayConfig {
            keys_env: "GEMINI_RELAY_TEST_POOL_SURELY_UNSET".to_string(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            missing.resolve_pool(&Env::default()).unwrap_err(),
            RelayError::Config(_)
        ));
        assert!(matches!(
            config
                .resolve_pool(&Env::parse_dotenv("GEMINI_RELAY_TEST_POOL=\" , ,\"\n"))
                .unwrap_err(),
            RelayError::Config(_)
        ));
        Ok(())
    }

    #[test]
    fn file_backend_seeds_counter_in_data_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RelayConfig {
            data_dir: dir.path().join("state"),
            ..RelayConfig::default()
        };
        let counter = config.build_counter()?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("state").join("key_counter.txt"))?.trim(),
            "0"
        );
        assert_eq!(counter.acquire_and_advance(2)?, 0);
        assert_eq!(counter.acquire_and_advance(2)?, 1);
        Ok(())
    }
}
