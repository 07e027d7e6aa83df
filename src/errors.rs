use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("incorrect username or password")]
    InvalidCredentials,

    #[error("inactive user")]
    UserInactive,

    #[error("email or username already registered")]
    DuplicateRegistration,

    #[error("invalid token")]
    TokenMalformed,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token type")]
    TokenTypeMismatch,

    #[error("refresh token revoked")]
    RefreshTokenRevoked,

    #[error("credential store temporarily unavailable")]
    TransientStoreFailure,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not authenticated")]
    Unauthorized,

    #[error("user not found")]
    UserNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by `UserRepository` / `RefreshTokenStore` backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unique constraint violated")]
    Duplicate,

    #[error("store error: {0}")]
    Backend(String),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => AuthError::TransientStoreFailure,
            StoreError::Duplicate => AuthError::DuplicateRegistration,
            StoreError::Backend(msg) => AuthError::Internal(msg),
        }
    }
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials
            | AuthError::TokenMalformed
            | AuthError::TokenExpired
            | AuthError::TokenTypeMismatch
            | AuthError::RefreshTokenRevoked
            | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::UserInactive => StatusCode::FORBIDDEN,
            AuthError::DuplicateRegistration => StatusCode::CONFLICT,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::TransientStoreFailure => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let msg = match &self {
            // backend details stay in the logs
            AuthError::Internal(detail) => {
                tracing::error!(error = %detail, "internal auth error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({ "error": msg }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
