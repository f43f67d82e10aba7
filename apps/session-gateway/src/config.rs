use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::EngineOptions;
use crate::media::DEFAULT_MAX_MEDIA_BYTES;
use crate::policy::LifecyclePolicy;

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bridge_command: String,
    pub bridge_args: Vec<String>,
    pub auth_dir: PathBuf,
    pub engine: EngineOptions,
    pub policy: LifecyclePolicy,
    pub max_media_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = match (var("SESSION_GATEWAY_ADDR"), var("PORT")) {
            (Some(addr), _) => parse("SESSION_GATEWAY_ADDR", &addr)?,
            (None, Some(port)) => {
                let port: u16 = parse("PORT", &port)?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            (None, None) => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };
        let log_filter = var("RUST_LOG").unwrap_or_else(|| "info,session_gateway=debug".into());
        let database_url = var("DATABASE_URL");
        let redis_url = var("REDIS_URL");
        let store_backend = match var("SESSION_STORE_BACKEND") {
            Some(value) => StoreBackend::parse(&value).ok_or(ConfigError {
                var: "SESSION_STORE_BACKEND",
                value,
            })?,
            None if database_url.is_some() => StoreBackend::Postgres,
            None if redis_url.is_some() => StoreBackend::Redis,
            None => StoreBackend::InMemory,
        };
        let bridge_command = var("SESSION_BRIDGE_COMMAND").unwrap_or_else(|| "session-bridge".into());
        let bridge_args = var("SESSION_BRIDGE_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let auth_dir = var("SESSION_AUTH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".session_auth"));

        let mut engine = EngineOptions::default();
        if let Some(path) =
            var("SESSION_BROWSER_EXECUTABLE").or_else(|| var("PUPPETEER_EXECUTABLE_PATH"))
        {
            engine.executable_path = PathBuf::from(path);
        }
        if let Some(root) = var("SESSION_PROFILE_ROOT") {
            engine.profile_root = PathBuf::from(root);
        }
        if let Some(value) = var("SESSION_HEADLESS") {
            engine.headless = parse_bool("SESSION_HEADLESS", &value)?;
        }
        if let Some(value) = var("SESSION_TAKEOVER_TIMEOUT_MS") {
            engine.takeover_timeout_ms = parse("SESSION_TAKEOVER_TIMEOUT_MS", &value)?;
        }

        let mut policy = LifecyclePolicy::default();
        if let Some(value) = var("SESSION_MAINTENANCE_INTERVAL_SECS") {
            policy.maintenance_interval =
                Duration::from_secs(parse("SESSION_MAINTENANCE_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = var("SESSION_RESTART_ON_MAINTENANCE") {
            policy.restart_on_maintenance = parse_bool("SESSION_RESTART_ON_MAINTENANCE", &value)?;
        }
        if let Some(value) = var("SESSION_RETRY_DELAY_MS") {
            policy.retry_delay = Duration::from_millis(parse("SESSION_RETRY_DELAY_MS", &value)?);
        }
        if let Some(value) = var("SESSION_MAX_STARTUP_FAILURES") {
            policy.max_startup_failures = parse("SESSION_MAX_STARTUP_FAILURES", &value)?;
        }
        if let Some(value) = var("SESSION_TEARDOWN_TIMEOUT_MS") {
            policy.teardown_timeout =
                Duration::from_millis(parse("SESSION_TEARDOWN_TIMEOUT_MS", &value)?);
        }

        let max_media_bytes = match var("SESSION_MAX_MEDIA_BYTES") {
            Some(value) => parse("SESSION_MAX_MEDIA_BYTES", &value)?,
            None => DEFAULT_MAX_MEDIA_BYTES,
        };

        Ok(Self {
            bind_addr,
            log_filter,
            store_backend,
            database_url,
            redis_url,
            bridge_command,
            bridge_args,
            auth_dir,
            engine,
            policy,
            max_media_bytes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres,
    Redis,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Some(StoreBackend::InMemory),
            "postgres" | "postgresql" | "pg" => Some(StoreBackend::Postgres),
            "redis" => Some(StoreBackend::Redis),
            _ => None,
        }
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            var,
            value: value.to_string(),
        }),
    }
}
