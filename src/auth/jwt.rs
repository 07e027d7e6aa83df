use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde_json::{Map, Value};

use crate::{
    clock::Clock,
    config::TokenConfig,
    errors::AuthError,
    models::jwt::{Claims, TokenType, RESERVED_CLAIMS},
};

/// Random bytes behind a refresh fingerprint (hex encoded: 64 chars).
const FINGERPRINT_BYTES: usize = 32;

#[derive(Clone)]
pub struct Keys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
}

impl Keys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Set for refresh tokens only.
    pub fingerprint: Option<String>,
}

/// Signs and verifies access/refresh tokens. Holds no mutable state.
#[derive(Clone)]
pub struct TokenCodec {
    keys: Keys,
    header: Header,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(cfg: &TokenConfig, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(cfg.algorithm);
        // expiry is checked against the injected clock in `decode`
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            keys: Keys::from_secret(cfg.secret.as_bytes()),
            header: Header::new(cfg.algorithm),
            validation,
            clock,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.header.alg
    }

    pub fn issue(
        &self,
        subject: &str,
        typ: TokenType,
        ttl: Duration,
        extra_claims: &Map<String, Value>,
    ) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Internal(format!("token lifetime {ttl} overflows")))?;

        let fingerprint = match typ {
            TokenType::Refresh => Some(new_fingerprint()),
            TokenType::Access => None,
        };

        let extra = extra_claims
            .iter()
            .filter(|(k, _)| !RESERVED_CLAIMS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let claims = Claims {
            sub: subject.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            typ,
            jti: fingerprint.clone(),
            extra,
        };

        let token = encode(&self.header, &claims, &self.keys.encoding)
            .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))?;

        Ok(IssuedToken {
            token,
            expires_at,
            fingerprint,
        })
    }

    /// Signature first, then expiry. The `type` claim is not inspected.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.keys.decoding, &self.validation)
            .map_err(|_| AuthError::TokenMalformed)?;

        if self.clock.now().timestamp() >= data.claims.exp {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    pub fn decode_expecting(&self, token: &str, expected: TokenType) -> Result<Claims, AuthError> {
        let claims = self.decode(token)?;
        if claims.typ != expected {
            return Err(AuthError::TokenTypeMismatch);
        }
        Ok(claims)
    }
}

fn new_fingerprint() -> String {
    let mut bytes = [0u8; FINGERPRINT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
pub(crate) fn test_token_config() -> TokenConfig {
    TokenConfig {
        secret: "test-secret-with-enough-bytes-for-hs256".into(),
        algorithm: Algorithm::HS256,
        access_ttl: Duration::minutes(15),
        refresh_ttl: Duration::days(30),
    }
}
