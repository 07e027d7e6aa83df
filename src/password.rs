//! Password hashing policy.
//!
//! New hashes use the configured primary scheme (Argon2id in PHC string format by default).
//! Hashes from schemes listed as deprecated still verify, and `needs_rehash` reports them so the
//! caller can upgrade them after a successful login.
//!
//! Both `hash` and `verify` truncate the candidate to [`MAX_PASSWORD_CHARS`] Unicode scalar values
//! before doing anything else. Truncating by `char` keeps the cut on a UTF-8 boundary, so a
//! non-ASCII password is cut at the same place on both paths.

use std::{fmt, str::FromStr};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::{
    config::{ConfigError, HasherConfig},
    errors::AuthError,
};

pub const MAX_PASSWORD_CHARS: usize = 128;

const BCRYPT_MIN_COST: u32 = 4;
const BCRYPT_MAX_COST: u32 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashScheme {
    Argon2id,
    Bcrypt,
}

impl FromStr for HashScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "argon2" | "argon2id" => Ok(HashScheme::Argon2id),
            "bcrypt" => Ok(HashScheme::Bcrypt),
            other => Err(format!("unknown password hash scheme `{other}`")),
        }
    }
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashScheme::Argon2id => f.write_str("argon2id"),
            HashScheme::Bcrypt => f.write_str("bcrypt"),
        }
    }
}

impl HashScheme {
    /// Identify the scheme that produced `hash` from its prefix.
    pub fn detect(hash: &str) -> Option<Self> {
        if hash.starts_with("$argon2") {
            Some(HashScheme::Argon2id)
        } else if ["$2a$", "$2b$", "$2x$", "$2y$"]
            .iter()
            .any(|p| hash.starts_with(p))
        {
            Some(HashScheme::Bcrypt)
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
    params: Params,
    primary: HashScheme,
    deprecated: Vec<HashScheme>,
    bcrypt_cost: u32,
}

impl CredentialHasher {
    pub fn new(cfg: &HasherConfig) -> Result<Self, ConfigError> {
        let params = Params::new(
            cfg.argon2_m_cost,
            cfg.argon2_t_cost,
            cfg.argon2_p_cost,
            None,
        )
        .map_err(|e| ConfigError::Invalid {
            key: "ARGON2_M_COST",
            reason: format!("invalid argon2 parameters: {e}"),
        })?;

        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&cfg.bcrypt_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                reason: format!("must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}"),
            });
        }

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone()),
            params,
            primary: cfg.primary,
            deprecated: cfg.deprecated.clone(),
            bcrypt_cost: cfg.bcrypt_cost,
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let password = truncate(password);
        match self.primary {
            HashScheme::Argon2id => {
                let salt = SaltString::generate(&mut OsRng);
                Ok(self
                    .argon2
                    .hash_password(password.as_bytes(), &salt)
                    .map_err(|e| AuthError::Internal(format!("argon2 hash: {e}")))?
                    .to_string())
            }
            HashScheme::Bcrypt => bcrypt::hash(password, self.bcrypt_cost)
                .map_err(|e| AuthError::Internal(format!("bcrypt hash: {e}"))),
        }
    }

    /// Never fails: malformed or unaccepted hashes simply do not verify.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        let password = truncate(password);
        let Some(scheme) = HashScheme::detect(hash) else {
            tracing::warn!("stored password hash has an unrecognised format");
            return false;
        };
        if !self.accepts(scheme) {
            tracing::warn!(%scheme, "stored password hash uses a scheme that is no longer accepted");
            return false;
        }

        match scheme {
            HashScheme::Argon2id => match PasswordHash::new(hash) {
                Ok(parsed) => self
                    .argon2
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed argon2 hash");
                    false
                }
            },
            HashScheme::Bcrypt => match bcrypt::verify(password, hash) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed bcrypt hash");
                    false
                }
            },
        }
    }

    pub fn needs_rehash(&self, hash: &str) -> bool {
        match HashScheme::detect(hash) {
            Some(scheme) if scheme != self.primary => true,
            Some(HashScheme::Argon2id) => match PasswordHash::new(hash) {
                Ok(parsed) => match Params::try_from(&parsed) {
                    Ok(p) => {
                        p.m_cost() != self.params.m_cost()
                            || p.t_cost() != self.params.t_cost()
                            || p.p_cost() != self.params.p_cost()
                    }
                    Err(_) => true,
                },
                Err(_) => true,
            },
            Some(HashScheme::Bcrypt) => bcrypt_cost_of(hash) != Some(self.bcrypt_cost),
            None => true,
        }
    }

    fn accepts(&self, scheme: HashScheme) -> bool {
        scheme == self.primary || self.deprecated.contains(&scheme)
    }
}

fn truncate(password: &str) -> &str {
    match password.char_indices().nth(MAX_PASSWORD_CHARS) {
        Some((idx, _)) => &password[..idx],
        None => password,
    }
}

// "$2b$12$..." -> 12
fn bcrypt_cost_of(hash: &str) -> Option<u32> {
    hash.split('$').nth(2)?.parse().ok()
}

#[cfg(test)]
pub(crate) fn fast_config() -> HasherConfig {
    HasherConfig {
        argon2_m_cost: 1024,
        argon2_t_cost: 1,
        argon2_p_cost: 1,
        bcrypt_cost: 4,
        ..HasherConfig::default()
    }
}
