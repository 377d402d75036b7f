//! Server configuration from `DRIVELITE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::network::tls::ClientTls;
use crate::service::Limits;

#[derive(Debug, Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// What to do with a connection that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Hold the accept loop until a slot frees up.
    Queue,
    /// Answer "server busy" and close.
    Reject,
}

impl FromStr for Overflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Overflow::Queue),
            "reject" => Ok(Overflow::Reject),
            other => Err(format!("expected queue or reject, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub overflow: Overflow,
    pub idle_timeout: Duration,
    pub storage_path: PathBuf,
    pub max_file_size: u64,
    pub session_ttl: Duration,
    pub reset_code_ttl: Duration,
    pub bcrypt_cost: u32,
    pub tls_pkcs12: Option<PathBuf>,
    pub tls_password: String,
    pub tls_insecure: bool,
    pub cleanup_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            max_clients: 50,
            overflow: Overflow::Queue,
            idle_timeout: Duration::from_secs(5 * 60),
            storage_path: PathBuf::from("./storage"),
            max_file_size: limits.max_file_size,
            session_ttl: limits.session_ttl,
            reset_code_ttl: limits.reset_code_ttl,
            bcrypt_cost: limits.bcrypt_cost,
            tls_pkcs12: None,
            tls_password: String::new(),
            tls_insecure: false,
            cleanup_interval: Duration::from_secs(10 * 60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Defaults overridden by whatever is set in the process environment.
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("DRIVELITE_HOST") {
            config.host = host.trim().to_string();
        }
        if let Some(v) = get("DRIVELITE_PORT") {
            config.port = parse("DRIVELITE_PORT", &v)?;
        }
        if let Some(v) = get("DRIVELITE_MAX_CLIENTS") {
            config.max_clients = parse("DRIVELITE_MAX_CLIENTS", &v)?;
            if config.max_clients == 0 {
                return Err(invalid("DRIVELITE_MAX_CLIENTS", &v, "must be at least 1"));
            }
        }
        if let Some(v) = get("DRIVELITE_OVERFLOW") {
            config.overflow = parse("DRIVELITE_OVERFLOW", &v)?;
        }
        if let Some(v) = get("DRIVELITE_IDLE_TIMEOUT") {
            config.idle_timeout = duration("DRIVELITE_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DRIVELITE_STORAGE_PATH") {
            config.storage_path = PathBuf::from(v.trim());
        }
        if let Some(v) = get("DRIVELITE_MAX_FILE_SIZE") {
            config.max_file_size = parse("DRIVELITE_MAX_FILE_SIZE", &v)?;
        }
        if let Some(v) = get("DRIVELITE_SESSION_TTL") {
            config.session_ttl = duration("DRIVELITE_SESSION_TTL", &v)?;
        }
        if let Some(v) = get("DRIVELITE_RESET_CODE_TTL") {
            config.reset_code_ttl = duration("DRIVELITE_RESET_CODE_TTL", &v)?;
        }
        if let Some(v) = get("DRIVELITE_BCRYPT_COST") {
            config.bcrypt_cost = parse("DRIVELITE_BCRYPT_COST", &v)?;
            if !(4..=31).contains(&config.bcrypt_cost) {
                return Err(invalid("DRIVELITE_BCRYPT_COST", &v, "must be between 4 and 31"));
            }
        }
        if let Some(v) = get("DRIVELITE_TLS_PKCS12") {
            config.tls_pkcs12 = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = lookup("DRIVELITE_TLS_PASSWORD") {
            config.tls_password = v;
        }
        if let Some(v) = get("DRIVELITE_TLS_INSECURE") {
            config.tls_insecure = flag("DRIVELITE_TLS_INSECURE", &v)?;
        }
        if let Some(v) = get("DRIVELITE_CLEANUP_INTERVAL") {
            config.cleanup_interval = duration("DRIVELITE_CLEANUP_INTERVAL", &v)?;
        }
        if let Some(v) = get("DRIVELITE_DRAIN_TIMEOUT") {
            config.drain_timeout = duration("DRIVELITE_DRAIN_TIMEOUT", &v)?;
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_file_size: self.max_file_size,
            session_ttl: self.session_ttl,
            reset_code_ttl: self.reset_code_ttl,
            bcrypt_cost: self.bcrypt_cost,
        }
    }

    /// Client-side TLS mode. `use_tls` comes from the command line.
    pub fn client_tls(&self, use_tls: bool) -> ClientTls {
        match (use_tls, self.tls_insecure) {
            (false, _) => ClientTls::Disabled,
            (true, false) => ClientTls::Verified,
            (true, true) => ClientTls::InsecureDevOnly,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(var, value, e.to_string()))
}

fn duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = humantime::parse_duration(value.trim()).map_err(|e| invalid(var, value, e.to_string()))?;
    if d.is_zero() {
        return Err(invalid(var, value, "must be greater than zero"));
    }
    Ok(d)
}

fn flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected true or false")),
    }
}
