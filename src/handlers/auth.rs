use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use crate::{
    auth::{tokens::TokenPair, BearerToken, CurrentUser},
    dto::auth::{
        ChangePasswordRequest, LoginRequest, RefreshRequest, RegisterRequest, StatusResponse,
        UpdateProfileRequest,
    },
    errors::AuthError,
    models::user::UserPublic,
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = UserPublic),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Email or username already registered")
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserPublic>), AuthError> {
    let user = state
        .auth
        .register(
            &req.email,
            &req.username,
            &req.password,
            req.full_name.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session started", body = TokenPair),
        (status = 401, description = "Incorrect username or password"),
        (status = 403, description = "Inactive user")
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    let pair = state
        .auth
        .login_with_password(&req.username, &req.password)
        .await?;
    Ok(Json(pair))
}

#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenPair),
        (status = 401, description = "Expired, revoked or wrong-type token")
    ),
    tag = "auth"
)]
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    Ok(Json(state.auth.refresh(&req.refresh_token).await?))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Session cleared", body = StatusResponse),
        (status = 401, description = "Missing or invalid access token")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<StatusResponse>, AuthError> {
    state.auth.logout(user_id).await?;
    Ok(Json(StatusResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/auth/revoke",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Refresh token no longer usable", body = StatusResponse),
        (status = 401, description = "Not a valid refresh token")
    ),
    tag = "auth"
)]
pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<StatusResponse>, AuthError> {
    state.auth.revoke_refresh(&req.refresh_token).await?;
    Ok(Json(StatusResponse::ok()))
}

#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Current user", body = UserPublic),
        (status = 401, description = "Missing or invalid access token")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    BearerToken(token): BearerToken,
) -> Result<Json<UserPublic>, AuthError> {
    Ok(Json(state.auth.current_user(&token).await?))
}

#[utoipa::path(
    put,
    path = "/auth/me",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Updated user", body = UserPublic),
        (status = 409, description = "Email already registered")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn update_me(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserPublic>, AuthError> {
    let user = state
        .auth
        .update_profile(user_id, req.full_name.as_deref(), req.email.as_deref())
        .await?;
    Ok(Json(user))
}

#[utoipa::path(
    put,
    path = "/auth/me/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed, session cleared", body = StatusResponse),
        (status = 401, description = "Current password is wrong")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<StatusResponse>, AuthError> {
    state
        .auth
        .change_password(user_id, &req.current_password, &req.new_password)
        .await?;
    Ok(Json(StatusResponse::ok()))
}
