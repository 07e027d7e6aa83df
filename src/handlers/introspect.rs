use std::sync::Arc;

use axum::{extract::State, Json};

use crate::{
    dto::auth::{IntrospectRequest, IntrospectResponse},
    errors::AuthError,
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/auth/introspect",
    request_body = IntrospectRequest,
    responses(
        (status = 200, description = "Token introspection result", body = IntrospectResponse)
    ),
    tag = "auth"
)]
pub async fn introspect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IntrospectRequest>,
) -> Result<Json<IntrospectResponse>, AuthError> {
    Ok(Json(state.auth.introspect(&req.token).await?))
}
