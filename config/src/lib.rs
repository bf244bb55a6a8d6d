//! `~/.yijing/config.toml` loading.
//!
//! ```toml
//! [gateway]
//! api_key = "${GEMINI_API_KEY}"
//! model = "gemini-2.5-pro"
//! fallback_models = ["gemini-2.5-flash", "gemini-2.0-flash"]
//!
//! [ledger]
//! monthly_quota = 1000
//!
//! [storage]
//! database = "~/.yijing/yijing.db"
//!
//! [readings]
//! retention_days = 30
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs};

use serde::Deserialize;
use thiserror::Error;
use yijing_types::{ApiKey, ModelName, ModelParseError};

const CONFIG_ENV: &str = "YIJING_CONFIG";
const API_KEY_ENV: &str = "GEMINI_API_KEY";
const DATA_DIR: &str = ".yijing";

pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_FALLBACK_MODELS: [&str; 2] = ["gemini-2.5-flash", "gemini-2.0-flash"];

const fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YijingConfig {
    pub gateway: GatewayConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
    pub readings: ReadingsConfig,
    pub prompt: PromptConfig,
}

// ============================================================================
// [gateway]
// ============================================================================

#[derive(Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Literal key or `${VAR}` reference. Falls back to `GEMINI_API_KEY`.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<ModelName>,
    pub fallback_models: Option<Vec<ModelName>>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub https_only: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            fallback_models: None,
            temperature: 1.0,
            max_output_tokens: 1500,
            stop_sequences: Vec::new(),
            connect_timeout_secs: 5,
            response_timeout_secs: 60,
            stream_idle_timeout_secs: 300,
            max_retries: 2,
            initial_backoff_ms: 500,
            https_only: true,
        }
    }
}

// Manual Debug impl to keep the API key out of logs.
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.api_key.is_some() {
            "[REDACTED]"
        } else {
            "None"
        };
        f.debug_struct("GatewayConfig")
            .field("api_key", &key)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("stop_sequences", &self.stop_sequences)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("response_timeout_secs", &self.response_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("https_only", &self.https_only)
            .finish()
    }
}

impl GatewayConfig {
    /// Configured key (after `${VAR}` expansion), else `GEMINI_API_KEY`.
    #[must_use]
    pub fn api_key(&self) -> Option<ApiKey> {
        self.api_key
            .as_deref()
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env::var(API_KEY_ENV).ok().filter(|key| !key.trim().is_empty()))
            .map(|key| ApiKey::new(key.trim()))
    }

    #[must_use]
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .map(expand_env_vars)
            .filter(|url| !url.trim().is_empty())
    }

    pub fn model(&self) -> Result<ModelName, ModelParseError> {
        match &self.model {
            Some(model) => Ok(model.clone()),
            None => ModelName::parse(DEFAULT_MODEL),
        }
    }

    /// An explicit empty list disables failover.
    #[must_use]
    pub fn fallback_models(&self) -> Vec<ModelName> {
        match &self.fallback_models {
            Some(models) => models.clone(),
            None => DEFAULT_FALLBACK_MODELS
                .iter()
                .filter_map(|name| ModelName::parse(name).ok())
                .collect(),
        }
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

// ============================================================================
// [ledger], [storage], [readings], [prompt]
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Subscriber readings per month; the daily cap is a thirtieth of this.
    pub monthly_quota: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            monthly_quota: 1000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: Option<String>,
}

impl StorageConfig {
    /// Configured path with `${VAR}` and a leading `~/` expanded, else `~/.yijing/yijing.db`.
    #[must_use]
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database.as_deref().map(expand_env_vars) {
            Some(raw) if !raw.trim().is_empty() => Some(expand_home(raw.trim())),
            _ => data_dir().map(|dir| dir.join("yijing.db")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReadingsConfig {
    /// Days a subscriber's unpinned reading is kept.
    pub retention_days: u32,
}

impl Default for ReadingsConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt: Option<String>,
}

// ============================================================================
// Loading
// ============================================================================

impl YijingConfig {
    /// Load from the default location. `Ok(None)` when no file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        warn_if_exposed(path, &content);

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

/// A literal key in a file readable by group or others.
fn warn_if_exposed(path: &Path, content: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let readable_by_others = fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o077 != 0)
            .unwrap_or(false);
        let literal_key = content
            .lines()
            .map(str::trim)
            .any(|line| line.starts_with("api_key") && !line.contains("${"));
        if readable_by_others && literal_key {
            tracing::warn!(
                path = %path.display(),
                "Config file holds a literal API key and is readable by other users. \
                 Use chmod 600 or a ${{VAR}} reference."
            );
        }
    }
    #[cfg(not(unix))]
    let _ = (path, content);
}

/// Expand `${VAR}` references from the environment. Missing vars become empty.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

/// `~/.yijing`, where the config, database and logs live by default.
#[must_use]
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR))
}

/// `$YIJING_CONFIG`, else `~/.yijing/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    data_dir().map(|dir| dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("YIJING_TEST_SINGLE", "replaced");
        }
        let result = expand_env_vars("prefix ${YIJING_TEST_SINGLE} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("YIJING_TEST_SINGLE");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("YIJING_TEST_MISSING");
        }
        assert_eq!(
            expand_env_vars("before ${YIJING_TEST_MISSING} after"),
            "before  after"
        );
    }

    #[test]
    fn expand_env_vars_adjacent_vars() {
        unsafe {
            std::env::set_var("YIJING_ADJ_A", "X");
            std::env::set_var("YIJING_ADJ_B", "Y");
        }
        assert_eq!(expand_env_vars("${YIJING_ADJ_A}${YIJING_ADJ_B}"), "XY");
        unsafe {
            std::env::remove_var("YIJING_ADJ_A");
            std::env::remove_var("YIJING_ADJ_B");
        }
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_name_dropped() {
        assert_eq!(expand_env_vars("卦 ${} 辭"), "卦  辭");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: YijingConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.model().unwrap().as_str(), DEFAULT_MODEL);
        let fallbacks: Vec<String> = config
            .gateway
            .fallback_models()
            .iter()
            .map(|m| m.as_str().to_string())
            .collect();
        assert_eq!(fallbacks, DEFAULT_FALLBACK_MODELS);
        assert_eq!(config.gateway.max_output_tokens, 1500);
        assert_eq!(config.gateway.max_retries, 2);
        assert_eq!(config.gateway.initial_backoff(), Duration::from_millis(500));
        assert_eq!(config.gateway.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.gateway.response_timeout(), Duration::from_secs(60));
        assert_eq!(config.gateway.stream_idle_timeout(), Duration::from_secs(300));
        assert!(config.gateway.https_only);
        assert_eq!(config.ledger.monthly_quota, 1000);
        assert_eq!(config.readings.retention_days, 30);
        assert!(config.prompt.system_prompt.is_none());
    }

    #[test]
    fn parse_gateway_section() {
        let config: YijingConfig = toml::from_str(
            r#"
[gateway]
model = "gemini-2.5-flash"
fallback_models = []
temperature = 0.7
max_output_tokens = 800
stop_sequences = ["END"]
max_retries = 4
https_only = false
"#,
        )
        .unwrap();
        let gateway = config.gateway;
        assert_eq!(gateway.model().unwrap().as_str(), "gemini-2.5-flash");
        assert!(gateway.fallback_models().is_empty());
        assert!((gateway.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(gateway.max_output_tokens, 800);
        assert_eq!(gateway.stop_sequences, vec!["END"]);
        assert_eq!(gateway.max_retries, 4);
        assert!(!gateway.https_only);
        // Unset fields keep their defaults.
        assert_eq!(gateway.stream_idle_timeout_secs, 300);
    }

    #[test]
    fn invalid_model_name_is_a_parse_error() {
        let result = toml::from_str::<YijingConfig>("[gateway]\nmodel = \"a/b\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn api_key_expands_env_reference() {
        unsafe {
            std::env::set_var("YIJING_TEST_KEY", "AIza-from-env");
        }
        let config: YijingConfig =
            toml::from_str("[gateway]\napi_key = \"${YIJING_TEST_KEY}\"\n").unwrap();
        let key = config.gateway.api_key().unwrap();
        assert_eq!(key.expose_secret(), "AIza-from-env");
        unsafe {
            std::env::remove_var("YIJING_TEST_KEY");
        }
    }

    #[test]
    fn gateway_debug_redacts_key() {
        let config: YijingConfig =
            toml::from_str("[gateway]\napi_key = \"AIzaSecret123\"\n").unwrap();
        let debug = format!("{:?}", config.gateway);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("AIzaSecret123"));
    }

    #[test]
    fn storage_path_expands_home() {
        let config: YijingConfig =
            toml::from_str("[storage]\ndatabase = \"~/data/yijing.db\"\n").unwrap();
        let path = config.storage.database_path().unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("data/yijing.db"));
        }
    }

    #[test]
    fn parse_remaining_sections() {
        let config: YijingConfig = toml::from_str(
            r#"
[ledger]
monthly_quota = 90

[readings]
retention_days = 7

[prompt]
system_prompt = "Answer briefly."
"#,
        )
        .unwrap();
        assert_eq!(config.ledger.monthly_quota, 90);
        assert_eq!(config.readings.retention_days, 7);
        assert_eq!(
            config.prompt.system_prompt.as_deref(),
            Some("Answer briefly.")
        );
    }

    #[test]
    fn load_from_reports_path_on_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = YijingConfig::load_from(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), missing);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[gateway\n").unwrap();
        let err = YijingConfig::load_from(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), broken);
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ledger]\nmonthly_quota = 300\n").unwrap();
        let config = YijingConfig::load_from(&path).unwrap();
        assert_eq!(config.ledger.monthly_quota, 300);
    }
}
