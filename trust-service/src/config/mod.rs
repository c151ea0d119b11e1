use secrecy::SecretString;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::MAX_REQUESTED_DAYS;

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub token: TokenConfig,
    pub storage_keys: StorageKeyConfig,
    pub reaper: ReaperConfig,
    pub consumers: ConsumerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub issuer: String,
    pub private_key_path: String,
    pub public_key_path: String,
    pub session_duration_minutes: i64,
}

impl TokenConfig {
    pub fn session_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_duration_minutes)
    }
}

/// Record signing and field encryption keys, newest first.
#[derive(Debug, Clone)]
pub struct StorageKeyConfig {
    pub signing_keys: Vec<SecretString>,
    pub encryption_keys: Vec<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub max_validity_periods: usize,
}

impl TrustConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        Self::from_source(common_config, |key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_source<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment: Environment = lookup("ENVIRONMENT")
            .unwrap_or_else(|| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let var = |key: &str, default: Option<&str>| get_env(&lookup, key, default, is_prod);

        let config = TrustConfig {
            common,
            environment: environment.clone(),
            service_name: var("SERVICE_NAME", Some("trust-service"))?,
            service_version: var("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")))?,
            log_level: var("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: lookup("OTLP_ENDPOINT").filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: var("DATABASE_URL", None)?,
                max_connections: parse(&var("DATABASE_MAX_CONNECTIONS", Some("10"))?, "DATABASE_MAX_CONNECTIONS")?,
                min_connections: parse(&var("DATABASE_MIN_CONNECTIONS", Some("1"))?, "DATABASE_MIN_CONNECTIONS")?,
            },
            token: TokenConfig {
                issuer: var("TOKEN_ISSUER", Some("trust-service"))?,
                private_key_path: var("TOKEN_PRIVATE_KEY_PATH", None)?,
                public_key_path: var("TOKEN_PUBLIC_KEY_PATH", None)?,
                session_duration_minutes: parse(
                    &var("SESSION_DURATION_MINUTES", Some("1440"))?,
                    "SESSION_DURATION_MINUTES",
                )?,
            },
            storage_keys: StorageKeyConfig {
                signing_keys: split_keys(&var("DB_SIGNING_KEYS", None)?),
                encryption_keys: split_keys(&var("DB_ENCRYPTION_KEYS", None)?),
            },
            reaper: ReaperConfig {
                interval_seconds: parse(
                    &var("SESSION_REAPER_INTERVAL_SECONDS", Some("60"))?,
                    "SESSION_REAPER_INTERVAL_SECONDS",
                )?,
            },
            consumers: ConsumerConfig {
                max_validity_periods: parse(
                    &var("MAX_VALIDITY_PERIODS", Some("10"))?,
                    "MAX_VALIDITY_PERIODS",
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.token.session_duration_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_DURATION_MINUTES must be positive"
            )));
        }

        if self.token.session_duration_minutes > MAX_REQUESTED_DAYS * 24 * 60 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_DURATION_MINUTES cannot exceed {} days",
                MAX_REQUESTED_DAYS
            )));
        }

        if self.reaper.interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_REAPER_INTERVAL_SECONDS must be positive"
            )));
        }

        if self.consumers.max_validity_periods == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MAX_VALIDITY_PERIODS must be at least 1"
            )));
        }

        if self.storage_keys.signing_keys.is_empty() || self.storage_keys.encryption_keys.is_empty()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DB_SIGNING_KEYS and DB_ENCRYPTION_KEYS need at least one key each"
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS cannot exceed DATABASE_MAX_CONNECTIONS"
            )));
        }

        Ok(())
    }
}

fn get_env<F>(lookup: &F, key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => Ok(val),
        None => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

fn split_keys(raw: &str) -> Vec<SecretString> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| SecretString::new(s.to_string()))
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
