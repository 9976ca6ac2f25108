use serde::Deserialize;
use serde_json::{Value, json};
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub app: AppConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    pub gmail: GmailConfig,
    pub sessions: SessionConfig,
    pub jobs: JobsConfig,
    pub categorization: CategorizationConfig,
    pub token_encryption_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig::default(),
            gmail: GmailConfig::default(),
            sessions: SessionConfig::default(),
            jobs: JobsConfig::default(),
            categorization: CategorizationConfig::default(),
            token_encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "mailroom".to_string(),
            env: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct StorageConfig {
    /// Root of per-user database files and token files.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.mailroom"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GmailConfig {
    pub api_base: Option<String>,
    pub batch_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            batch_size: 50,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    pub multi_user: bool,
    pub ttl_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            multi_user: false,
            ttl_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct JobsConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub retention_days: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval_ms: 100,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintStrategy {
    /// Hash of user, email id, subject, and sender only.
    Partial,
    /// Canonical JSON of the full analysis context.
    Full,
}

/// Tuning knobs and rule configs for the categorization pipeline.
///
/// Rule entries stay as untyped JSON bags here; they are parsed into the
/// typed [`crate::rules::Rule`] form when the analyzers are built, and
/// unknown rule types fail that parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CategorizationConfig {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub fingerprint: FingerprintStrategy,
    pub parallel: bool,
    pub analyzer_timeout_ms: u64,
    pub recent_days: i64,
    pub moderate_days: i64,
    pub small_max_bytes: i64,
    pub medium_max_bytes: i64,
    pub recency_weight: f64,
    pub size_weight: f64,
    pub spam_low_threshold: f64,
    pub promotional_low_threshold: f64,
    pub analysis_version: String,
    pub rules: Vec<Value>,
}

impl Default for CategorizationConfig {
    fn default() -> Self {
        Self {
            high_threshold: 10.0,
            low_threshold: -3.0,
            cache_enabled: true,
            cache_ttl_secs: 300,
            fingerprint: FingerprintStrategy::Partial,
            parallel: true,
            analyzer_timeout_ms: 2_000,
            recent_days: 7,
            moderate_days: 30,
            small_max_bytes: 102_400,
            medium_max_bytes: 1_048_576,
            recency_weight: 0.6,
            size_weight: 0.4,
            spam_low_threshold: 0.5,
            promotional_low_threshold: 0.5,
            analysis_version: "modular-1".to_string(),
            rules: default_rules(),
        }
    }
}

/// Built-in rule set used when no rules are configured.
pub fn default_rules() -> Vec<Value> {
    vec![
        json!({
            "id": "urgent-keywords",
            "name": "Urgent keywords",
            "type": "keyword",
            "priority": 100,
            "weight": 15.0,
            "keywords": ["urgent", "asap", "critical", "emergency", "action required", "alert"],
        }),
        json!({
            "id": "important-labels",
            "name": "Important labels",
            "type": "label",
            "priority": 90,
            "weight": 10.0,
            "labels": ["IMPORTANT", "STARRED"],
        }),
        json!({
            "id": "newsletter-keywords",
            "name": "Newsletter keywords",
            "type": "keyword",
            "priority": 50,
            "weight": -8.0,
            "keywords": ["newsletter", "unsubscribe", "weekly digest", "promotion"],
        }),
        json!({
            "id": "no-reply-sender",
            "name": "No-reply sender",
            "type": "noReply",
            "priority": 40,
            "weight": -5.0,
        }),
        json!({
            "id": "large-attachment",
            "name": "Large attachment",
            "type": "largeAttachment",
            "priority": 30,
            "weight": 3.0,
            "min_size": 10_485_760,
        }),
    ]
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid {name} override: {value}")]
    InvalidOverride { name: &'static str, value: String },
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides,
    /// and resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.finish()?;
        Ok(cfg)
    }

    /// Configuration from defaults plus environment overrides only, for
    /// deployments that run without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        cfg.finish()?;
        Ok(cfg)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides()?;
        self.resolve_env_markers()?;
        self.expand_paths();
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = env::var("STORAGE_PATH") {
            self.storage.path = PathBuf::from(path);
        }

        if let Ok(multi) = env::var("MULTI_USER_MODE") {
            self.sessions.multi_user = match multi.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        name: "MULTI_USER_MODE",
                        value: multi,
                    });
                }
            };
        }

        if let Ok(batch) = env::var("GMAIL_BATCH_SIZE") {
            self.gmail.batch_size =
                batch.parse().map_err(|_| ConfigError::InvalidOverride {
                    name: "GMAIL_BATCH_SIZE",
                    value: batch,
                })?;
        }

        if let Ok(key) = env::var("TOKEN_ENCRYPTION_KEY") {
            self.token_encryption_key = Some(key);
        }

        if let Ok(app_env) = env::var("APP_ENV") {
            self.app.env = app_env;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.storage.path)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        if let Some(base) = &mut self.gmail.api_base {
            apply_env_marker(base)?;
        }
        if let Some(key) = &mut self.token_encryption_key {
            apply_env_marker(key)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let storage_string = self.storage.path.to_string_lossy().to_string();
        let storage = shellexpand::tilde(&storage_string);
        self.storage.path = PathBuf::from(storage.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
