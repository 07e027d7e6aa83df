use chrono::Duration;
use serde::Serialize;
use serde_json::Map;
use utoipa::ToSchema;

use crate::{
    auth::jwt::TokenCodec,
    errors::AuthError,
    models::{jwt::TokenType, refresh_token::RefreshTokenRecord, user::User, user::UserPublic},
};

pub const TOKEN_TYPE_BEARER: &str = "bearer";

/// What login and refresh hand back to the client. TTLs are in seconds.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub user: UserPublic,
}

/// Signs a fresh access/refresh pair for `user`. The returned record is what
/// the session store must hold for the refresh token to be accepted later.
pub fn mint_pair(
    codec: &TokenCodec,
    user: &User,
    access_ttl: Duration,
    refresh_ttl: Duration,
) -> Result<(TokenPair, RefreshTokenRecord), AuthError> {
    let subject = user.id.to_string();
    let access = codec.issue(&subject, TokenType::Access, access_ttl, &Map::new())?;
    let refresh = codec.issue(&subject, TokenType::Refresh, refresh_ttl, &Map::new())?;

    let fingerprint = refresh
        .fingerprint
        .ok_or_else(|| AuthError::Internal("refresh token issued without a fingerprint".into()))?;

    let record = RefreshTokenRecord {
        fingerprint,
        expires_at: refresh.expires_at,
    };
    let pair = TokenPair {
        access_token: access.token,
        refresh_token: refresh.token,
        token_type: TOKEN_TYPE_BEARER.to_string(),
        expires_in: access_ttl.num_seconds(),
        refresh_expires_in: refresh_ttl.num_seconds(),
        user: user.into(),
    };
    Ok((pair, record))
}
