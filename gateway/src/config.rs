//! Environment-driven configuration, loaded once at startup. Secrets are
//! wrapped so they never show up in a `{:?}` log line by accident.

use common::secret::{ExposeSecret, SecretBox};
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default replay window for signed calls (§4.10), milliseconds.
const DEFAULT_SIGN_RECEIVE_WINDOW_MS: i64 = 5000;
/// Default provider key store reload cadence (§4.3), seconds.
const DEFAULT_PROVIDER_RELOAD_INTERVAL_SECS: u64 = 1800;
const DEFAULT_JWT_CLOCK_SKEW_SECONDS: i64 = common::jwt::DEFAULT_CLOCK_SKEW_SECONDS;
const MAX_JWT_CLOCK_SKEW_SECONDS: i64 = common::jwt::MAX_CLOCK_SKEW_SECONDS;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application-wide configuration. Cloned into the `ServerContext` that
/// replaces the C++ `Application` singleton (see design notes); never
/// mutated after startup.
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub certs_prefix: String,
    /// HS256 secret used to re-sign verified third-party JWTs and to sign
    /// the gateway's own tokens where applicable.
    pub server_hs256_secret: SecretBox<Vec<u8>>,
    /// `server_pwd` forwarded to `daemon.TokenFetch`/`daemon.SignUp`.
    pub admin_password: SecretBox<Vec<u8>>,
    pub sign_receive_window_ms: i64,
    pub provider_reload_interval_secs: u64,
    pub jwt_clock_skew_seconds: i64,
    pub otlp_endpoint: Option<String>,
    pub fixed_server_time_ms: Option<i64>,
    pub enabled: bool,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout: Duration,
    pub db_idle_timeout: Duration,
    pub db_max_lifetime: Duration,
    pub db_statement_timeout_secs: u64,
    pub drain_seconds: u64,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            database_url: self.database_url.clone(),
            bind_address: self.bind_address.clone(),
            certs_prefix: self.certs_prefix.clone(),
            server_hs256_secret: SecretBox::new(Box::new(
                self.server_hs256_secret.expose_secret().clone(),
            )),
            admin_password: SecretBox::new(Box::new(self.admin_password.expose_secret().clone())),
            sign_receive_window_ms: self.sign_receive_window_ms,
            provider_reload_interval_secs: self.provider_reload_interval_secs,
            jwt_clock_skew_seconds: self.jwt_clock_skew_seconds,
            otlp_endpoint: self.otlp_endpoint.clone(),
            fixed_server_time_ms: self.fixed_server_time_ms,
            enabled: self.enabled,
            db_max_connections: self.db_max_connections,
            db_min_connections: self.db_min_connections,
            db_acquire_timeout: self.db_acquire_timeout,
            db_idle_timeout: self.db_idle_timeout,
            db_max_lifetime: self.db_max_lifetime,
            db_statement_timeout_secs: self.db_statement_timeout_secs,
            drain_seconds: self.drain_seconds,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("certs_prefix", &self.certs_prefix)
            .field("server_hs256_secret", &"[REDACTED]")
            .field("admin_password", &"[REDACTED]")
            .field("sign_receive_window_ms", &self.sign_receive_window_ms)
            .field(
                "provider_reload_interval_secs",
                &self.provider_reload_interval_secs,
            )
            .field("jwt_clock_skew_seconds", &self.jwt_clock_skew_seconds)
            .field("otlp_endpoint", &self.otlp_endpoint)
            .field("fixed_server_time_ms", &self.fixed_server_time_ms)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn env_var(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), v)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_var("DATABASE_URL")?;
        let bind_address = env_var_or("BIND_ADDRESS", "0.0.0.0:8080");
        let certs_prefix = env_var_or("CERTS_PREFIX", "/etc/apostol-gateway/certs");

        let server_hs256_secret = env_var("SERVER_HS256_SECRET")?.into_bytes();
        let admin_password = env_var("ADMIN_PASSWORD")?.into_bytes();

        let sign_receive_window_ms =
            env_parse_or("SIGN_RECEIVE_WINDOW_MS", DEFAULT_SIGN_RECEIVE_WINDOW_MS)?;
        let provider_reload_interval_secs = env_parse_or(
            "PROVIDER_RELOAD_INTERVAL_SECS",
            DEFAULT_PROVIDER_RELOAD_INTERVAL_SECS,
        )?;
        let jwt_clock_skew_seconds =
            env_parse_or("JWT_CLOCK_SKEW_SECONDS", DEFAULT_JWT_CLOCK_SKEW_SECONDS)?;
        if !(0..=MAX_JWT_CLOCK_SKEW_SECONDS).contains(&jwt_clock_skew_seconds) {
            return Err(ConfigError::InvalidValue(
                "JWT_CLOCK_SKEW_SECONDS".to_string(),
                jwt_clock_skew_seconds.to_string(),
            ));
        }

        let otlp_endpoint = env::var("OTLP_ENDPOINT").ok();
        let fixed_server_time_ms = env::var("FIXED_SERVER_TIME_MS")
            .ok()
            .and_then(|v| v.parse().ok());
        let enabled = env_var_or("GATEWAY_ENABLED", "true") != "false";

        Ok(Config {
            database_url,
            bind_address,
            certs_prefix,
            server_hs256_secret: SecretBox::new(Box::new(server_hs256_secret)),
            admin_password: SecretBox::new(Box::new(admin_password)),
            sign_receive_window_ms,
            provider_reload_interval_secs,
            jwt_clock_skew_seconds,
            otlp_endpoint,
            fixed_server_time_ms,
            enabled,
            db_max_connections: env_parse_or("DB_MAX_CONNECTIONS", 20)?,
            db_min_connections: env_parse_or("DB_MIN_CONNECTIONS", 2)?,
            db_acquire_timeout: Duration::from_secs(env_parse_or("DB_ACQUIRE_TIMEOUT_SECS", 5)?),
            db_idle_timeout: Duration::from_secs(env_parse_or("DB_IDLE_TIMEOUT_SECS", 600)?),
            db_max_lifetime: Duration::from_secs(env_parse_or("DB_MAX_LIFETIME_SECS", 1800)?),
            db_statement_timeout_secs: env_parse_or("DB_STATEMENT_TIMEOUT_SECS", 30)?,
            drain_seconds: env_parse_or("DRAIN_SECONDS", 30)?,
        })
    }

    /// Append a statement_timeout option to the connection string, tuning
    /// per-query timeouts at the connection level rather than per-call.
    pub fn database_url_with_timeout(&self) -> String {
        let sep = if self.database_url.contains('?') { "&" } else { "?" };
        format!(
            "{}{}options=-c%20statement_timeout%3D{}s",
            self.database_url, sep, self.db_statement_timeout_secs
        )
    }
}
