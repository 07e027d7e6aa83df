use std::{fmt, str::FromStr, time::Duration as StdDuration};

use chrono::Duration;
use jsonwebtoken::Algorithm;
use thiserror::Error;

use crate::password::HashScheme;

/// One week.
const MAX_ACCESS_TTL_MINUTES: i64 = 7 * 24 * 60;
/// Ten years.
const MAX_REFRESH_TTL_DAYS: i64 = 3650;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,

    /// When unset the process runs on the in-memory store.
    pub mongodb_uri: Option<String>,
    pub db_name: String,
    pub store_timeout: StdDuration,

    pub tokens: TokenConfig,
    pub hasher: HasherConfig,
}

#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HasherConfig {
    pub primary: HashScheme,
    /// Schemes whose existing hashes still verify but get upgraded on next login.
    pub deprecated: Vec<HashScheme>,
    pub argon2_m_cost: u32,
    pub argon2_t_cost: u32,
    pub argon2_p_cost: u32,
    pub bcrypt_cost: u32,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            primary: HashScheme::Argon2id,
            deprecated: vec![HashScheme::Bcrypt],
            argon2_m_cost: 19_456,
            argon2_t_cost: 2,
            argon2_p_cost: 1,
            bcrypt_cost: 12,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let algorithm = match get("JWT_ALGORITHM") {
            Some(v) => parse_algorithm(&v)?,
            None => Algorithm::HS256,
        };

        let access_minutes: i64 = parse_or("ACCESS_TOKEN_EXPIRE_MINUTES", get, 15)?;
        let refresh_days: i64 = parse_or("REFRESH_TOKEN_EXPIRE_DAYS", get, 30)?;
        let access_ttl = bounded_ttl(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            access_minutes,
            MAX_ACCESS_TTL_MINUTES,
            Duration::try_minutes,
        )?;
        let refresh_ttl = bounded_ttl(
            "REFRESH_TOKEN_EXPIRE_DAYS",
            refresh_days,
            MAX_REFRESH_TTL_DAYS,
            Duration::try_days,
        )?;

        let store_timeout_ms: u64 = parse_or("STORE_TIMEOUT_MS", get, 5_000)?;
        if store_timeout_ms == 0 {
            return Err(invalid("STORE_TIMEOUT_MS", "must be positive"));
        }

        let defaults = HasherConfig::default();
        let primary = match get("PASSWORD_HASH_SCHEME") {
            Some(v) => v
                .parse()
                .map_err(|reason| invalid("PASSWORD_HASH_SCHEME", reason))?,
            None => defaults.primary,
        };
        let deprecated = match get("PASSWORD_DEPRECATED_SCHEMES") {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(HashScheme::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| invalid("PASSWORD_DEPRECATED_SCHEMES", reason))?,
            None => defaults.deprecated,
        };

        let hasher = HasherConfig {
            primary,
            deprecated,
            argon2_m_cost: parse_or("ARGON2_M_COST", get, defaults.argon2_m_cost)?,
            argon2_t_cost: parse_or("ARGON2_T_COST", get, defaults.argon2_t_cost)?,
            argon2_p_cost: parse_or("ARGON2_P_COST", get, defaults.argon2_p_cost)?,
            bcrypt_cost: parse_or("BCRYPT_COST", get, defaults.bcrypt_cost)?,
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".to_string()),
            mongodb_uri: get("MONGODB_URI"),
            db_name: get("DB_NAME").unwrap_or_else(|| "auth_db".to_string()),
            store_timeout: StdDuration::from_millis(store_timeout_ms),
            tokens: TokenConfig {
                secret,
                algorithm,
                access_ttl,
                refresh_ttl,
            },
            hasher,
        })
    }
}

fn bounded_ttl(
    key: &'static str,
    value: i64,
    max: i64,
    to_duration: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    if value <= 0 {
        return Err(invalid(key, "must be positive"));
    }
    if value > max {
        return Err(invalid(key, format!("must be at most {max}")));
    }
    to_duration(value).ok_or_else(|| invalid(key, "out of range"))
}

fn parse_algorithm(raw: &str) -> Result<Algorithm, ConfigError> {
    let alg = Algorithm::from_str(raw.trim())
        .map_err(|_| invalid("JWT_ALGORITHM", format!("unknown algorithm `{raw}`")))?;
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(alg),
        _ => Err(invalid(
            "JWT_ALGORITHM",
            "only HMAC algorithms (HS256, HS384, HS512) work with a shared secret",
        )),
    }
}

fn parse_or<T, G>(key: &'static str, get: G, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".into(),
        mongodb_uri: None,
        db_name: "auth_test".into(),
        store_timeout: StdDuration::from_millis(200),
        tokens: crate::auth::jwt::test_token_config(),
        hasher: crate::password::fast_config(),
    }
}
