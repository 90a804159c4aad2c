use std::{env, fmt, net::SocketAddr};

use super::{database_url, server_bind_address};

const DEV_HOOK_SECRET: &str = "development-hook-secret";
const DEV_ADMIN_SECRET: &str = "development-admin-secret";

pub const DEFAULT_REVERIFY_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_GROUP_META_FIELD: &str = "wcb2b_group";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Tunables for the assignment engine and login re-verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSettings {
    /// Age after which a login triggers a fresh assignment.
    pub reverify_window_days: u32,
    /// Maximum number of entries retained in the assignment log.
    pub log_capacity: usize,
    /// User meta key the host platform reads the customer group from.
    pub group_field: String,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            reverify_window_days: DEFAULT_REVERIFY_WINDOW_DAYS,
            log_capacity: DEFAULT_LOG_CAPACITY,
            group_field: DEFAULT_GROUP_META_FIELD.to_string(),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub hook_secret: String,
    pub admin_token_secret: String,
    pub assignment: AssignmentSettings,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let hook_secret = secret_from_env("HOOK_SECRET", environment, DEV_HOOK_SECRET)?;
        let admin_token_secret =
            secret_from_env("ADMIN_TOKEN_SECRET", environment, DEV_ADMIN_SECRET)?;

        let reverify_window_days = parse_number(
            "REVERIFY_WINDOW_DAYS",
            DEFAULT_REVERIFY_WINDOW_DAYS,
        )?;
        let log_capacity = parse_number("ASSIGNMENT_LOG_CAPACITY", DEFAULT_LOG_CAPACITY)?;
        if log_capacity == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "ASSIGNMENT_LOG_CAPACITY",
                value: "0".to_string(),
            });
        }
        let group_field = env::var("GROUP_META_FIELD")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GROUP_META_FIELD.to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            hook_secret,
            admin_token_secret,
            assignment: AssignmentSettings {
                reverify_window_days,
                log_capacity,
                group_field,
            },
        })
    }
}

fn secret_from_env(
    key: &'static str,
    environment: Environment,
    fallback: &str,
) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ if environment == Environment::Production => Err(ConfigError::MissingSecret(key)),
        _ => Ok(fallback.to_string()),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingSecret(&'static str),
    InvalidNumber { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingSecret(key) => write!(f, "{key} must be set in production"),
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
