//! Layered configuration loading with figment.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`POLAR_TESTER_*`, `__` separates sections)
//! 2. The TOML file given with `--config`, else `./polar-tester.toml`
//! 3. Built-in defaults
//!
//! `POLAR_TESTER_MODEL__NAME=gpt-4o` maps to `model.name`,
//! `POLAR_TESTER_STORAGE__BACKEND=s3` to `storage.backend`, and so on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::client::{ChatClientConfig, DEFAULT_MODEL, OPENAI_CHAT_URL};
use crate::error::ConfigError;
use crate::generate::{DEFAULT_MAX_ATTEMPTS, GenerateConfig};
use crate::store::{LocalStore, ObjectStoreBackend, SessionStore};
use crate::validator::{self, CliValidator};

/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "polar-tester.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "POLAR_TESTER_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub validator: ValidatorConfig,
    pub storage: StorageConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

/// `[model]`: the chat-completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub name: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Environment variable holding the bearer key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: OPENAI_CHAT_URL.to_string(),
            name: DEFAULT_MODEL.to_string(),
            temperature: Some(0.1),
            max_tokens: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

impl ModelConfig {
    /// Client settings, reading the API key from `api_key_env`.
    pub fn client_config(&self) -> Result<ChatClientConfig, ConfigError> {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                field: "model.api_key_env".into(),
                reason: format!("environment variable {} is not set", self.api_key_env),
            })?;
        Ok(ChatClientConfig {
            endpoint: self.endpoint.clone(),
            api_key,
            model: self.name.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// `[validator]`: the external syntax checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub command: String,
    /// Arguments placed before the policy file path.
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            command: validator::DEFAULT_PROGRAM.to_string(),
            args: vec!["validate".to_string()],
            timeout_secs: validator::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl ValidatorConfig {
    pub fn build(&self) -> CliValidator {
        CliValidator::new(&self.command)
            .with_args(self.args.iter().cloned())
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

/// Which [`SessionStore`] implementation to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
    /// Non-persistent; sessions vanish when the process exits.
    Memory,
}

/// `[storage]`: where sessions, artifacts, and event logs live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the local backend.
    pub path: PathBuf,
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// S3-compatible endpoint (MinIO, R2, ...).
    pub endpoint: Option<String>,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
    /// Age in days after which `session cleanup` removes an idle event log.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            path: PathBuf::from("./test_sessions"),
            bucket: None,
            region: None,
            endpoint: None,
            prefix: None,
            retention_days: 90,
        }
    }
}

impl StorageConfig {
    /// Construct the configured backend.
    pub fn open(&self) -> crate::Result<Arc<dyn SessionStore>> {
        let store: Arc<dyn SessionStore> = match self.backend {
            StorageBackend::Local => Arc::new(LocalStore::new(&self.path)),
            StorageBackend::Memory => Arc::new(ObjectStoreBackend::in_memory()),
            StorageBackend::S3 => {
                let bucket = self.bucket.as_deref().ok_or_else(|| ConfigError::Invalid {
                    field: "storage.bucket".into(),
                    reason: "required when storage.backend = \"s3\"".into(),
                })?;
                let backend = ObjectStoreBackend::s3(
                    bucket,
                    self.region.as_deref(),
                    self.endpoint.as_deref(),
                )?;
                match &self.prefix {
                    Some(prefix) => Arc::new(backend.with_prefix(prefix.as_str())),
                    None => Arc::new(backend),
                }
            }
        };
        tracing::debug!("Opened {:?} storage", self.backend);
        Ok(store)
    }
}

/// `[generation]`: the retry loop and default context documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    /// Context files used when `--context` is not given.
    pub context_files: Vec<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            context_files: Vec::new(),
        }
    }
}

/// `[logging]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from defaults, the TOML file, and the environment, then check
    /// the result. An explicitly named file must exist.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_file
            && !path.exists()
        {
            return Err(ConfigError::Invalid {
                field: "config".into(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        let config: Self = Self::figment(config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider chain, exposed so tests can layer more providers.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        };
        if self.generation.max_attempts == 0 {
            return Err(invalid("generation.max_attempts", "must be at least 1"));
        }
        if self.validator.command.trim().is_empty() {
            return Err(invalid("validator.command", "must not be empty"));
        }
        if self.validator.timeout_secs == 0 {
            return Err(invalid("validator.timeout_secs", "must be positive"));
        }
        if self.storage.retention_days == 0 {
            return Err(invalid("storage.retention_days", "must be at least 1"));
        }
        if self.model.timeout_secs == 0 {
            return Err(invalid("model.timeout_secs", "must be positive"));
        }
        if let Some(t) = self.model.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(invalid("model.temperature", "must be between 0 and 2"));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_none() {
            return Err(invalid(
                "storage.bucket",
                "required when storage.backend = \"s3\"",
            ));
        }
        Ok(())
    }

    /// Loop settings derived from `[generation]` and `[model]`.
    pub fn generate_config(&self) -> GenerateConfig {
        GenerateConfig {
            max_attempts: self.generation.max_attempts,
            model_timeout: Some(Duration::from_secs(self.model.timeout_secs)),
        }
    }

    /// The config as a TOML document (what `init` writes).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
