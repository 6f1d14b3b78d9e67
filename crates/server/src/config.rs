use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// A capability token paired with the user identity it proves. Credential
/// verification proper happens upstream of this server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub metrics_bind: Option<String>,
    pub store: StoreBackend,
    pub postgres_dsn: Option<String>,
    pub connection_buffer: usize,
    pub tokens: Vec<TokenEntry>,
}

/// Loads flock server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("FLOCK_BIND", map.remove("server.bind"))?)?;
    let metrics_bind = override_env("FLOCK_METRICS_BIND", map.remove("server.metrics_bind"))?;
    let backend_raw = override_env("FLOCK_STORE", map.remove("storage.backend"))?
        .unwrap_or_else(|| "postgres".to_string());
    let store = match backend_raw.as_str() {
        "postgres" => StoreBackend::Postgres,
        "memory" => StoreBackend::Memory,
        _ => return Err(ConfigError::Invalid),
    };
    let postgres_dsn = override_env("FLOCK_PG_DSN", map.remove("storage.postgres_dsn"))?;
    if store == StoreBackend::Postgres && postgres_dsn.is_none() {
        return Err(ConfigError::Missing);
    }
    let connection_buffer =
        override_env("FLOCK_CONNECTION_BUFFER", map.remove("server.connection_buffer"))?
            .unwrap_or_else(|| "128".to_string())
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid)?;
    if connection_buffer == 0 {
        return Err(ConfigError::Invalid);
    }
    let tokens_raw = override_env("FLOCK_TOKENS", map.remove("auth.tokens"))?;
    let tokens = parse_tokens(tokens_raw.unwrap_or_default())?;

    Ok(ServerConfig {
        bind,
        metrics_bind,
        store,
        postgres_dsn,
        connection_buffer,
        tokens,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_tokens(raw: String) -> Result<Vec<TokenEntry>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut tokens = Vec::new();
    for entry in raw.split(';') {
        if entry.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split(',').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let token = parts[0].trim().to_string();
        let user_id = parts[1].trim().to_string();
        if token.is_empty() || user_id.is_empty() {
            return Err(ConfigError::Invalid);
        }
        tokens.push(TokenEntry { token, user_id });
    }
    Ok(tokens)
}
