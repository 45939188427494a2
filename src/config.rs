//! Configuration: a YAML file merged under environment-variable
//! overrides, with defaults matching a stock local PostgreSQL.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSettings {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Seconds; becomes the backend idle_in_transaction_session_timeout.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// 0 means kernel-assigned, useful for tests.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Seconds a session may idle before eviction.
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
    /// Seconds between upstream pings; 0 disables keepalive.
    #[serde(default)]
    pub keepalive_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: String,
}

fn default_pg_host() -> String {
    "localhost".to_string()
}
fn default_pg_port() -> u16 {
    5432
}
fn default_pg_database() -> String {
    "postgres".to_string()
}
fn default_pg_user() -> String {
    "postgres".to_string()
}
fn default_session_timeout() -> u64 {
    3600
}
fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}
fn default_listen_port() -> u16 {
    5433
}
fn default_proxy_timeout() -> u64 {
    86_400
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password: String::new(),
            session_timeout: default_session_timeout(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            timeout: default_proxy_timeout(),
            keepalive_interval: 0,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

impl Settings {
    /// Loads settings: file (when given and present) under env
    /// overrides, validated. Env wins over file, file over defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("POSTGRES_HOST") {
            self.postgres.host = host;
        }
        if let Ok(port) = std::env::var("POSTGRES_PORT") {
            self.postgres.port = parse_env("POSTGRES_PORT", &port)?;
        }
        if let Ok(database) = std::env::var("POSTGRES_DB") {
            self.postgres.database = database;
        }
        if let Ok(user) = std::env::var("POSTGRES_USER") {
            self.postgres.user = user;
        }
        if let Ok(password) = std::env::var("POSTGRES_PASSWORD") {
            self.postgres.password = password;
        }
        if let Ok(timeout) = std::env::var("POSTGRES_SESSION_TIMEOUT") {
            self.postgres.session_timeout = parse_env("POSTGRES_SESSION_TIMEOUT", &timeout)?;
        }
        if let Ok(host) = std::env::var("PGROLLBACK_LISTEN_HOST") {
            self.proxy.listen_host = host;
        }
        if let Ok(port) = std::env::var("PGROLLBACK_LISTEN_PORT") {
            self.proxy.listen_port = parse_env("PGROLLBACK_LISTEN_PORT", &port)?;
        }
        if let Ok(timeout) = std::env::var("PGROLLBACK_TIMEOUT") {
            self.proxy.timeout = parse_env("PGROLLBACK_TIMEOUT", &timeout)?;
        }
        if let Ok(interval) = std::env::var("PGROLLBACK_KEEPALIVE_INTERVAL") {
            self.proxy.keepalive_interval = parse_env("PGROLLBACK_KEEPALIVE_INTERVAL", &interval)?;
        }
        if let Ok(level) = std::env::var("PGROLLBACK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(file) = std::env::var("PGROLLBACK_LOG_FILE") {
            self.logging.file = file;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.postgres.host.is_empty() {
            return Err(ConfigError::Missing("postgres.host"));
        }
        if self.postgres.port == 0 {
            return Err(ConfigError::Missing("postgres.port"));
        }
        if self.postgres.database.is_empty() {
            return Err(ConfigError::Missing("postgres.database"));
        }
        if self.postgres.user.is_empty() {
            return Err(ConfigError::Missing("postgres.user"));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.postgres.session_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.keepalive_interval)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-var tests mutate process state; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "POSTGRES_HOST",
            "POSTGRES_PORT",
            "POSTGRES_DB",
            "POSTGRES_USER",
            "POSTGRES_PASSWORD",
            "POSTGRES_SESSION_TIMEOUT",
            "PGROLLBACK_LISTEN_HOST",
            "PGROLLBACK_LISTEN_PORT",
            "PGROLLBACK_TIMEOUT",
            "PGROLLBACK_KEEPALIVE_INTERVAL",
            "PGROLLBACK_LOG_LEVEL",
            "PGROLLBACK_LOG_FILE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_stand_alone() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_env();
        let settings = Settings::load(None).expect("defaults should load");
        assert_eq!(settings.postgres.host, "localhost");
        assert_eq!(settings.postgres.port, 5432);
        assert_eq!(settings.proxy.listen_port, 5433);
        assert_eq!(settings.proxy.keepalive_interval, 0);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.idle_timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn environment_overrides_win() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_env();
        std::env::set_var("POSTGRES_HOST", "db.internal");
        std::env::set_var("POSTGRES_PORT", "6543");
        std::env::set_var("PGROLLBACK_LISTEN_PORT", "0");
        std::env::set_var("PGROLLBACK_LOG_LEVEL", "debug");
        let settings = Settings::load(None).expect("env overrides should load");
        clear_env();
        assert_eq!(settings.postgres.host, "db.internal");
        assert_eq!(settings.postgres.port, 6543);
        assert_eq!(settings.proxy.listen_port, 0);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn malformed_env_values_error_out() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_env();
        std::env::set_var("POSTGRES_PORT", "not-a-port");
        let result = Settings::load(None);
        clear_env();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_env();
        std::env::set_var("POSTGRES_USER", "");
        let result = Settings::load(None);
        clear_env();
        assert!(matches!(result, Err(ConfigError::Missing("postgres.user"))));
    }
}
