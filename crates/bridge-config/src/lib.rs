use bridge_contracts::CALLBACK_PATH;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "BRIDGE_CONFIG_PATH";
pub const SECRET_NAME_ENV: &str = "SF_SECRET_NAME";

const CONFIG_SCHEMA: &str = include_str!("../schema/config.schema.json");
const SECRET_SCHEMA: &str = include_str!("../schema/secret.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("secret is not valid JSON: {0}")]
    SecretDecode(String),
    #[error("secret failed validation: {0}")]
    SecretInvalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub token: Token,
    #[serde(default)]
    pub crm: Crm,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    #[serde(default = "default_refresh_margin_ms")]
    pub refresh_margin_ms: i64,
    #[serde(default = "default_expires_in_secs")]
    pub default_expires_in_secs: i64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            refresh_margin_ms: default_refresh_margin_ms(),
            default_expires_in_secs: default_expires_in_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crm {
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
}

impl Default for Crm {
    fn default() -> Self {
        Self {
            callback_path: default_callback_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    8_000
}

fn default_refresh_margin_ms() -> i64 {
    60_000
}

fn default_expires_in_secs() -> i64 {
    900
}

fn default_callback_path() -> String {
    CALLBACK_PATH.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Client credentials and endpoints decoded from the secret store.
#[derive(Debug)]
pub struct SecretConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub apex_base: Option<String>,
}

#[derive(Deserialize)]
struct RawSecret {
    #[serde(rename = "SF_TOKEN_URL")]
    token_url: String,
    #[serde(rename = "SF_CLIENT_ID")]
    client_id: String,
    #[serde(rename = "SF_CLIENT_SECRET")]
    client_secret: String,
    #[serde(rename = "SF_APEX_BASE", default)]
    apex_base: Option<String>,
}

impl SecretConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let instance: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConfigError::SecretDecode(e.to_string()))?;
        check_instance(secret_validator()?, &instance)
            .map_err(|e| ConfigError::SecretInvalid(e.to_string()))?;

        let raw: RawSecret = serde_json::from_value(instance)
            .map_err(|e| ConfigError::SecretInvalid(e.to_string()))?;
        Ok(Self {
            token_url: raw.token_url,
            client_id: raw.client_id,
            client_secret: SecretString::from(raw.client_secret),
            apex_base: raw.apex_base.filter(|v| !v.is_empty()),
        })
    }
}

/// Loads settings from the process environment.
pub fn load_from_env() -> Result<Config, ConfigError> {
    load_with(|key| std::env::var(key).ok())
}

/// Loads settings using `lookup` for environment values: an optional YAML
/// file named by `BRIDGE_CONFIG_PATH`, then the `SF_SECRET_NAME` override.
pub fn load_with<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match lookup(CONFIG_PATH_ENV).filter(|v| !v.trim().is_empty()) {
        Some(path) => load_and_validate(&path)?,
        None => Config::default(),
    };
    if let Some(name) = lookup(SECRET_NAME_ENV).filter(|v| !v.is_empty()) {
        cfg.secret_name = Some(name);
    }
    Ok(cfg)
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // An empty file parses as null; treat it as all defaults.
    let instance = match serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))? {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other,
    };
    let validator = compile_schema(CONFIG_SCHEMA).map_err(ConfigError::SchemaLoad)?;
    check_instance(&validator, &instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

// Secrets are decoded on every invocation; the schema is compiled once.
static SECRET_VALIDATOR: LazyLock<Result<jsonschema::Validator, String>> =
    LazyLock::new(|| compile_schema(SECRET_SCHEMA));

fn secret_validator() -> Result<&'static jsonschema::Validator, ConfigError> {
    SECRET_VALIDATOR
        .as_ref()
        .map_err(|e| ConfigError::SchemaLoad(e.clone()))
}

fn compile_schema(schema_text: &str) -> Result<jsonschema::Validator, String> {
    let schema: serde_json::Value = serde_json::from_str(schema_text).map_err(|e| e.to_string())?;
    jsonschema::validator_for(&schema).map_err(|e| e.to_string())
}

fn check_instance(
    validator: &jsonschema::Validator,
    instance: &serde_json::Value,
) -> Result<(), ConfigError> {
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.http.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "http.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.token.refresh_margin_ms < 0 {
        return Err(ConfigError::UnsupportedConfig(
            "token.refresh_margin_ms must be >= 0".to_string(),
        ));
    }
    if cfg.token.default_expires_in_secs < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "token.default_expires_in_secs must be >= 1".to_string(),
        ));
    }
    if !cfg.crm.callback_path.starts_with('/') {
        return Err(ConfigError::UnsupportedConfig(format!(
            "crm.callback_path={} must start with /",
            cfg.crm.callback_path
        )));
    }
    if !matches!(
        cfg.logging.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.level={} is not supported; supported: trace, debug, info, warn, error",
            cfg.logging.level
        )));
    }
    Ok(())
}
