//! Configuration loader and validator for the parcel notification service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub phone: Phone,
    pub whatsapp: WhatsApp,
    pub flights: Flights,
    pub loyalty: Loyalty,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
    /// Seconds between background flight poll sweeps; 0 disables the loop.
    pub flight_poll_interval_secs: u64,
}

/// Phone normalization defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phone {
    pub default_country_code: String,
    pub known_country_codes: Vec<String>,
}

/// WhatsApp Cloud API settings. Credentials here are the last fallback after
/// the secret store and the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhatsApp {
    pub api_base: String,
    pub api_version: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
    pub language: String,
    /// Template used when a free-form message hits a closed session window.
    /// Empty disables the fallback.
    #[serde(default)]
    pub fallback_template: String,
}

/// Flight-data API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flights {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub daily_query_budget: u32,
    pub max_checks_per_run: usize,
}

/// Loyalty program parameters (amounts in minor currency units).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Loyalty {
    pub currency_per_point: i64,
    pub point_value: i64,
    pub min_redeem_points: i64,
    pub code_ttl_minutes: i64,
    pub max_code_attempts: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default SQLite URL under the data directory.
    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/parcel-notify.db?mode=rwc",
            self.app.data_dir.trim_end_matches('/')
        )
    }
}

/// Upper bound for `loyalty.code_ttl_minutes` (one day).
pub const MAX_CODE_TTL_MINUTES: i64 = 24 * 60;

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.listen_addr must be non-empty"));
    }

    let cc = cfg.phone.default_country_code.trim();
    if cc.is_empty() || !cc.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::Invalid(
            "phone.default_country_code must be digits only",
        ));
    }
    if cfg
        .phone
        .known_country_codes
        .iter()
        .any(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_digit()))
    {
        return Err(ConfigError::Invalid(
            "phone.known_country_codes entries must be digits only",
        ));
    }

    if cfg.whatsapp.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("whatsapp.api_base must be non-empty"));
    }
    if cfg.whatsapp.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("whatsapp.api_version must be non-empty"));
    }
    if cfg.whatsapp.language.trim().is_empty() {
        return Err(ConfigError::Invalid("whatsapp.language must be non-empty"));
    }

    if cfg.flights.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("flights.endpoint must be non-empty"));
    }
    if cfg.flights.max_checks_per_run == 0 {
        return Err(ConfigError::Invalid("flights.max_checks_per_run must be > 0"));
    }

    let l = &cfg.loyalty;
    if l.currency_per_point <= 0 {
        return Err(ConfigError::Invalid("loyalty.currency_per_point must be > 0"));
    }
    if l.point_value <= 0 {
        return Err(ConfigError::Invalid("loyalty.point_value must be > 0"));
    }
    if l.min_redeem_points <= 0 {
        return Err(ConfigError::Invalid("loyalty.min_redeem_points must be > 0"));
    }
    if l.code_ttl_minutes <= 0 || l.code_ttl_minutes > MAX_CODE_TTL_MINUTES {
        return Err(ConfigError::Invalid(
            "loyalty.code_ttl_minutes must be between 1 and 1440",
        ));
    }
    if l.max_code_attempts <= 0 {
        return Err(ConfigError::Invalid("loyalty.max_code_attempts must be > 0"));
    }

    Ok(())
}

/// Returns the documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "0.0.0.0:8080"
  flight_poll_interval_secs: 900

phone:
  default_country_code: "57"
  known_country_codes: ["1", "34", "44", "49", "51", "52", "54", "55", "56", "57", "58", "506", "507", "591", "593", "595", "598"]

whatsapp:
  api_base: "https://graph.facebook.com/"
  api_version: "v21.0"
  # token and phone_number_id are normally read from the secret store or
  # WHATSAPP_TOKEN / WHATSAPP_PHONE_NUMBER_ID.
  language: "es"
  fallback_template: "notificacion_general"

flights:
  endpoint: "https://flights.example.com/v1/status"
  api_key: "YOUR_FLIGHT_API_KEY"
  daily_query_budget: 300
  max_checks_per_run: 25

loyalty:
  currency_per_point: 1000
  point_value: 10
  min_redeem_points: 100
  code_ttl_minutes: 10
  max_code_attempts: 3
"#
}
