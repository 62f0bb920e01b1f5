use config::{Config, ConfigError, Environment, File};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_RESERVATION_TTL_HOURS: i64 = 24;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
const DEFAULT_PRINTIFY_REQUESTS_PER_MINUTE: u32 = 600;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// ISO currency code used for payments
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Default tax rate (as decimal, e.g., 0.08 for 8%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub default_tax_rate: f64,

    /// Flat shipping rates per method
    #[serde(default = "default_standard_shipping_rate")]
    #[validate(custom = "validate_money")]
    pub standard_shipping_rate: f64,
    #[serde(default = "default_express_shipping_rate")]
    #[validate(custom = "validate_money")]
    pub express_shipping_rate: f64,

    /// Discounted subtotal at or above which standard shipping is free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_money")]
    pub free_shipping_threshold: f64,

    /// Hours an untouched cart keeps its reservation
    #[serde(default = "default_reservation_ttl_hours")]
    #[validate(range(min = 1))]
    pub reservation_ttl_hours: i64,

    /// Interval of the in-process reservation sweeper, 0 disables it
    #[serde(default = "default_sweep_interval_secs")]
    pub reservation_sweep_interval_secs: u64,

    /// Token required in `x-admin-token` for administrative routes
    #[serde(default)]
    pub admin_api_token: Option<String>,

    /// Shared secret for payment webhook signatures
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Allowed clock skew for webhook timestamps (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// PayPal REST credentials
    #[serde(default)]
    pub paypal_client_id: Option<String>,
    #[serde(default)]
    pub paypal_client_secret: Option<String>,
    #[serde(default = "default_paypal_base_url")]
    pub paypal_base_url: String,

    /// Printify API access
    #[serde(default)]
    pub printify_api_token: Option<String>,
    #[serde(default)]
    pub printify_shop_id: Option<String>,
    #[serde(default = "default_printify_base_url")]
    pub printify_base_url: String,
    #[serde(default = "default_printify_requests_per_minute")]
    #[validate(range(min = 1))]
    pub printify_requests_per_minute: u32,

    /// Timeout applied to every outbound HTTP call (seconds)
    #[serde(default = "default_external_timeout_secs")]
    #[validate(range(min = 1))]
    pub external_timeout_secs: u64,

    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

#[derive(Error, Debug)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl AppConfig {
    /// Configuration suitable for tests and local tooling: defaults everywhere,
    /// pointed at the given database.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            currency: default_currency(),
            default_tax_rate: default_tax_rate(),
            standard_shipping_rate: default_standard_shipping_rate(),
            express_shipping_rate: default_express_shipping_rate(),
            free_shipping_threshold: default_free_shipping_threshold(),
            reservation_ttl_hours: DEFAULT_RESERVATION_TTL_HOURS,
            reservation_sweep_interval_secs: 0,
            admin_api_token: None,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_base_url: default_paypal_base_url(),
            printify_api_token: None,
            printify_shop_id: None,
            printify_base_url: default_printify_base_url(),
            printify_requests_per_minute: DEFAULT_PRINTIFY_REQUESTS_PER_MINUTE,
            external_timeout_secs: default_external_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn tax_rate(&self) -> Decimal {
        to_decimal(self.default_tax_rate, 4)
    }

    /// Pricing parameters for the order orchestrator.
    pub fn pricing(&self) -> PricingConfig {
        PricingConfig {
            tax_rate: self.tax_rate(),
            standard_shipping: to_decimal(self.standard_shipping_rate, 2),
            express_shipping: to_decimal(self.express_shipping_rate, 2),
            free_shipping_threshold: to_decimal(self.free_shipping_threshold, 2),
        }
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    /// Returns the sweeper interval, or `None` when the sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.reservation_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.reservation_sweep_interval_secs))
    }

    pub fn paypal_credentials(&self) -> Option<(String, String)> {
        match (&self.paypal_client_id, &self.paypal_client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.clone(), secret.clone()))
            }
            _ => None,
        }
    }

    pub fn printify_credentials(&self) -> Option<(String, String)> {
        match (&self.printify_api_token, &self.printify_shop_id) {
            (Some(token), Some(shop)) if !token.is_empty() && !shop.is_empty() => {
                Some((token.clone(), shop.clone()))
            }
            _ => None,
        }
    }
}

/// Tax and shipping parameters in money precision.
#[derive(Clone, Debug, PartialEq)]
pub struct PricingConfig {
    pub tax_rate: Decimal,
    pub standard_shipping: Decimal,
    pub express_shipping: Decimal,
    pub free_shipping_threshold: Decimal,
}

fn to_decimal(value: f64, dp: u32) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(dp))
        .unwrap_or_default()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_tax_rate() -> f64 {
    0.08
}

fn default_standard_shipping_rate() -> f64 {
    5.99
}

fn default_express_shipping_rate() -> f64 {
    14.99
}

fn default_free_shipping_threshold() -> f64 {
    75.0
}

fn default_reservation_ttl_hours() -> i64 {
    DEFAULT_RESERVATION_TTL_HOURS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_paypal_base_url() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}

fn default_printify_base_url() -> String {
    "https://api.printify.com/v1".to_string()
}

fn default_printify_requests_per_minute() -> u32 {
    DEFAULT_PRINTIFY_REQUESTS_PER_MINUTE
}

fn default_external_timeout_secs() -> u64 {
    15
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate >= 1.0 {
        let mut err = ValidationError::new("default_tax_rate");
        err.message = Some("default_tax_rate must be a finite value in [0.0, 1.0)".into());
        return Err(err);
    }
    Ok(())
}

fn validate_money(amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() || amount < 0.0 {
        let mut err = ValidationError::new("amount");
        err.message = Some("amounts must be finite and non-negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration from the `config` directory.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (`{dir}/default.toml`)
/// 3. Environment-specific config (`{dir}/{env}.toml`)
/// 4. Environment variables (`APP__*`)
pub fn load_config_from(dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&dir.join(&run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::TempDir;

    fn write_default(content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.toml"), content).unwrap();
        dir
    }

    #[test]
    fn loads_values_from_default_file() {
        let dir = write_default(
            r#"
            database_url = "sqlite::memory:"
            environment = "test"
            default_tax_rate = 0.1
            reservation_ttl_hours = 2
            printify_shop_id = "12345"
            "#,
        );

        let config = load_config_from(dir.path()).unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.reservation_ttl_hours, 2);
        assert_eq!(config.tax_rate(), dec!(0.1));
        assert_eq!(config.printify_shop_id.as_deref(), Some("12345"));
        assert_eq!(config.printify_requests_per_minute, 600);
    }

    #[test]
    fn rejects_out_of_range_tax_rate() {
        let dir = write_default(
            r#"
            default_tax_rate = 1.5
            "#,
        );

        let result = load_config_from(dir.path());
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
        if let Err(AppConfigError::Validation(errors)) = result {
            assert!(errors.field_errors().contains_key("default_tax_rate"));
        }
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = AppConfig::new("sqlite::memory:".into(), "test".into());
        config.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn pricing_is_rounded_to_money_precision() {
        let mut config = AppConfig::new("sqlite::memory:".into(), "test".into());
        config.standard_shipping_rate = 4.999;
        let pricing = config.pricing();
        assert_eq!(pricing.standard_shipping, dec!(5.00));
        assert_eq!(pricing.free_shipping_threshold, dec!(75));
    }

    #[test]
    fn sweeper_disabled_when_interval_is_zero() {
        let config = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert!(config.sweep_interval().is_none());
        assert!(config.paypal_credentials().is_none());
    }
}
