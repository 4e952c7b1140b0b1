use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub erp: ErpConfig,
    pub webhook: WebhookConfig,
    pub correlation: CorrelationSettings,
    pub sla: SlaSettings,
    pub intake: IntakeConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ErpConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub secret: SecretString,
}

#[derive(Clone, Debug)]
pub struct CorrelationSettings {
    /// Absolute amount variance (major units) still merged as the same
    /// invoice.
    pub amount_tolerance: String,
    pub attachment_lookback_days: i64,
}

#[derive(Clone, Debug)]
pub struct SlaSettings {
    pub approval_sla_minutes: i64,
    pub interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IntakeConfig {
    /// Upper bound on detections processed concurrently by batch intake.
    pub max_concurrency: usize,
    pub auto_approval_threshold: f64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub webhook_secret: Option<String>,
    pub erp_base_url: Option<String>,
    pub erp_api_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://apflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                health_check_port: 8081,
                graceful_shutdown_secs: 15,
            },
            erp: ErpConfig { base_url: None, api_key: None, timeout_secs: 30 },
            webhook: WebhookConfig { secret: String::new().into() },
            correlation: CorrelationSettings {
                amount_tolerance: "0.01".to_string(),
                attachment_lookback_days: 30,
            },
            sla: SlaSettings { approval_sla_minutes: 24 * 60, interval_secs: 300 },
            intake: IntakeConfig { max_concurrency: 8, auto_approval_threshold: 0.85 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("apflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(erp) = patch.erp {
            if let Some(base_url) = erp.base_url {
                self.erp.base_url = Some(base_url);
            }
            if let Some(erp_api_key_value) = erp.api_key {
                self.erp.api_key = Some(secret_value(erp_api_key_value));
            }
            if let Some(timeout_secs) = erp.timeout_secs {
                self.erp.timeout_secs = timeout_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(webhook_secret_value) = webhook.secret {
                self.webhook.secret = secret_value(webhook_secret_value);
            }
        }

        if let Some(correlation) = patch.correlation {
            if let Some(amount_tolerance) = correlation.amount_tolerance {
                self.correlation.amount_tolerance = amount_tolerance;
            }
            if let Some(attachment_lookback_days) = correlation.attachment_lookback_days {
                self.correlation.attachment_lookback_days = attachment_lookback_days;
            }
        }

        if let Some(sla) = patch.sla {
            if let Some(approval_sla_minutes) = sla.approval_sla_minutes {
                self.sla.approval_sla_minutes = approval_sla_minutes;
            }
            if let Some(interval_secs) = sla.interval_secs {
                self.sla.interval_secs = interval_secs;
            }
        }

        if let Some(intake) = patch.intake {
            if let Some(max_concurrency) = intake.max_concurrency {
                self.intake.max_concurrency = max_concurrency;
            }
            if let Some(auto_approval_threshold) = intake.auto_approval_threshold {
                self.intake.auto_approval_threshold = auto_approval_threshold;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("APFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("APFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("APFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("APFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("APFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("APFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("APFLOW_SERVER_PORT") {
            self.server.port = parse_u16("APFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("APFLOW_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("APFLOW_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("APFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("APFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("APFLOW_ERP_BASE_URL") {
            self.erp.base_url = Some(value);
        }
        if let Some(value) = read_env("APFLOW_ERP_API_KEY") {
            self.erp.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("APFLOW_ERP_TIMEOUT_SECS") {
            self.erp.timeout_secs = parse_u64("APFLOW_ERP_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("APFLOW_WEBHOOK_SECRET") {
            self.webhook.secret = secret_value(value);
        }

        if let Some(value) = read_env("APFLOW_CORRELATION_AMOUNT_TOLERANCE") {
            self.correlation.amount_tolerance = value;
        }
        if let Some(value) = read_env("APFLOW_CORRELATION_ATTACHMENT_LOOKBACK_DAYS") {
            self.correlation.attachment_lookback_days =
                parse_i64("APFLOW_CORRELATION_ATTACHMENT_LOOKBACK_DAYS", &value)?;
        }

        if let Some(value) = read_env("APFLOW_SLA_APPROVAL_MINUTES") {
            self.sla.approval_sla_minutes = parse_i64("APFLOW_SLA_APPROVAL_MINUTES", &value)?;
        }
        if let Some(value) = read_env("APFLOW_SLA_INTERVAL_SECS") {
            self.sla.interval_secs = parse_u64("APFLOW_SLA_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("APFLOW_INTAKE_MAX_CONCURRENCY") {
            self.intake.max_concurrency =
                parse_u32("APFLOW_INTAKE_MAX_CONCURRENCY", &value)? as usize;
        }
        if let Some(value) = read_env("APFLOW_INTAKE_AUTO_APPROVAL_THRESHOLD") {
            self.intake.auto_approval_threshold =
                parse_f64("APFLOW_INTAKE_AUTO_APPROVAL_THRESHOLD", &value)?;
        }

        let log_level = read_env("APFLOW_LOGGING_LEVEL").or_else(|| read_env("APFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("APFLOW_LOGGING_FORMAT").or_else(|| read_env("APFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.webhook.secret = secret_value(webhook_secret);
        }
        if let Some(erp_base_url) = overrides.erp_base_url {
            self.erp.base_url = Some(erp_base_url);
        }
        if let Some(erp_api_key) = overrides.erp_api_key {
            self.erp.api_key = Some(secret_value(erp_api_key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_erp(&self.erp)?;
        validate_webhook(&self.webhook)?;
        validate_correlation(&self.correlation)?;
        validate_sla(&self.sla)?;
        validate_intake(&self.intake)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("apflow.toml"), PathBuf::from("config/apflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be greater than zero".to_string(),
        ));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.port == server.health_check_port {
        return Err(ConfigError::Validation(
            "server.port and server.health_check_port must differ".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_erp(erp: &ErpConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &erp.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "erp.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if erp.timeout_secs == 0 || erp.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "erp.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    if webhook.secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "webhook.secret is required; approval callbacks cannot be verified without it"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_correlation(correlation: &CorrelationSettings) -> Result<(), ConfigError> {
    if correlation.amount_tolerance.trim().parse::<f64>().map_or(true, |value| value < 0.0) {
        return Err(ConfigError::Validation(
            "correlation.amount_tolerance must be a non-negative decimal".to_string(),
        ));
    }

    if correlation.attachment_lookback_days <= 0 {
        return Err(ConfigError::Validation(
            "correlation.attachment_lookback_days must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_sla(sla: &SlaSettings) -> Result<(), ConfigError> {
    if sla.approval_sla_minutes <= 0 {
        return Err(ConfigError::Validation(
            "sla.approval_sla_minutes must be greater than zero".to_string(),
        ));
    }

    if sla.interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sla.interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_intake(intake: &IntakeConfig) -> Result<(), ConfigError> {
    if intake.max_concurrency == 0 {
        return Err(ConfigError::Validation(
            "intake.max_concurrency must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&intake.auto_approval_threshold) {
        return Err(ConfigError::Validation(
            "intake.auto_approval_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    erp: Option<ErpPatch>,
    webhook: Option<WebhookPatch>,
    correlation: Option<CorrelationPatch>,
    sla: Option<SlaPatch>,
    intake: Option<IntakePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErpPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CorrelationPatch {
    amount_tolerance: Option<String>,
    attachment_lookback_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SlaPatch {
    approval_sla_minutes: Option<i64>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IntakePatch {
    max_concurrency: Option<usize>,
    auto_approval_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_WEBHOOK_SECRET", "wh-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("apflow.toml");
            fs::write(
                &path,
                r#"
[webhook]
secret = "${TEST_WEBHOOK_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.webhook.secret.expose_secret() == "wh-from-env",
                "webhook secret should be loaded from environment",
            )
        })();

        clear_vars(&["TEST_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("APFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("APFLOW_WEBHOOK_SECRET", "wh-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("apflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[webhook]
secret = "wh-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.webhook.secret.expose_secret() == "wh-from-env",
                "env webhook secret should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["APFLOW_DATABASE_URL", "APFLOW_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("webhook.secret")
            );
            ensure(has_message, "validation failure should mention webhook.secret")
        })();

        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("APFLOW_WEBHOOK_SECRET", "wh-secret-value");
        env::set_var("APFLOW_ERP_API_KEY", "erp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("wh-secret-value"),
                "debug output should not contain webhook secret",
            )?;
            ensure(
                !debug.contains("erp-secret-value"),
                "debug output should not contain erp api key",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["APFLOW_WEBHOOK_SECRET", "APFLOW_ERP_API_KEY"]);
        result
    }

    #[test]
    fn invalid_sla_interval_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("APFLOW_WEBHOOK_SECRET", "wh-valid");
        env::set_var("APFLOW_SLA_APPROVAL_MINUTES", "0");

        let result = (|| -> Result<(), String> {
            match AppConfig::load(LoadOptions::default()) {
                Ok(_) => Err("expected sla validation failure".to_string()),
                Err(ConfigError::Validation(message)) => {
                    ensure(message.contains("sla."), "error should name the sla section")
                }
                Err(other) => Err(format!("unexpected error kind: {other}")),
            }
        })();

        clear_vars(&["APFLOW_WEBHOOK_SECRET", "APFLOW_SLA_APPROVAL_MINUTES"]);
        result
    }
}
