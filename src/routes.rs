use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::{
    auth::tokens::TokenPair,
    dto::auth::{
        ChangePasswordRequest, IntrospectRequest, IntrospectResponse, LoginRequest,
        RefreshRequest, RegisterRequest, StatusResponse, UpdateProfileRequest,
    },
    handlers::{auth as auth_handlers, introspect as introspect_handlers},
    models::{jwt::TokenType, user::UserPublic},
    state::AppState,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        auth_handlers::register,
        auth_handlers::login,
        auth_handlers::refresh,
        auth_handlers::logout,
        auth_handlers::revoke,
        auth_handlers::me,
        auth_handlers::update_me,
        auth_handlers::change_password,
        introspect_handlers::introspect,
    ),
    components(schemas(
        RegisterRequest,
        LoginRequest,
        RefreshRequest,
        UpdateProfileRequest,
        ChangePasswordRequest,
        IntrospectRequest,
        IntrospectResponse,
        StatusResponse,
        TokenPair,
        TokenType,
        UserPublic,
    )),
    modifiers(&BearerAuth),
    tags((name = "auth", description = "Registration, sessions and token lifecycle"))
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let auth = Router::new()
        .route("/register", post(auth_handlers::register))
        .route("/login", post(auth_handlers::login))
        .route("/refresh", post(auth_handlers::refresh))
        .route("/logout", post(auth_handlers::logout))
        .route("/revoke", post(auth_handlers::revoke))
        .route("/introspect", post(introspect_handlers::introspect))
        .route("/me", get(auth_handlers::me).put(auth_handlers::update_me))
        .route("/me/password", put(auth_handlers::change_password));

    Router::new()
        .nest("/auth", auth)
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, config::test_config, store::memory::MemoryStore};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let state =
            AppState::with_stores(&test_config(), store.clone(), store, Arc::new(SystemClock))
                .unwrap();
        app_router(Arc::new(state))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(b) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn register_and_login(app: &Router) -> Value {
        let (status, user) = call(
            app,
            "POST",
            "/auth/register",
            None,
            Some(json!({
                "email": "alice@example.com",
                "username": "alice",
                "password": "s3cretpass",
                "full_name": "Alice"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user["username"], "alice");
        assert!(user.get("password_hash").is_none());

        let (status, pair) = call(
            app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "s3cretpass" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        pair
    }

    #[tokio::test]
    async fn full_session_lifecycle_over_http() {
        let app = app();
        let pair = register_and_login(&app).await;
        assert_eq!(pair["token_type"], "bearer");
        assert_eq!(pair["expires_in"], 900);
        assert_eq!(pair["refresh_expires_in"], 2_592_000);
        let access = pair["access_token"].as_str().unwrap();
        let refresh = pair["refresh_token"].as_str().unwrap();

        let (status, me) = call(&app, "GET", "/auth/me", Some(access), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["email"], "alice@example.com");

        let (status, rotated) = call(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let access = rotated["access_token"].as_str().unwrap();
        let refresh2 = rotated["refresh_token"].as_str().unwrap();

        let (status, body) = call(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "refresh token revoked");

        let (status, body) = call(&app, "POST", "/auth/logout", Some(access), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, _) = call(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh2 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn error_statuses() {
        let app = app();
        register_and_login(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "email": "alice@example.com", "username": "a2", "password": "s3cretpass" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "nope-nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "incorrect username or password");

        let (status, body) = call(&app, "GET", "/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "not authenticated");

        let (status, _) = call(&app, "GET", "/auth/me", Some("not.a.jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn profile_and_password_endpoints() {
        let app = app();
        let pair = register_and_login(&app).await;
        let access = pair["access_token"].as_str().unwrap();
        let refresh = pair["refresh_token"].as_str().unwrap();

        let (status, user) = call(
            &app,
            "PUT",
            "/auth/me",
            Some(access),
            Some(json!({ "full_name": "Alice L." })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["full_name"], "Alice L.");

        let (status, _) = call(
            &app,
            "PUT",
            "/auth/me/password",
            Some(access),
            Some(json!({ "current_password": "s3cretpass", "new_password": "an0ther-pass" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn introspect_and_revoke() {
        let app = app();
        let pair = register_and_login(&app).await;
        let refresh = pair["refresh_token"].as_str().unwrap();

        let (status, info) = call(
            &app,
            "POST",
            "/auth/introspect",
            None,
            Some(json!({ "token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["active"], true);
        assert_eq!(info["token_type"], "refresh");

        let (status, _) = call(
            &app,
            "POST",
            "/auth/revoke",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, info) = call(
            &app,
            "POST",
            "/auth/introspect",
            None,
            Some(json!({ "token": refresh })),
        )
        .await;
        assert_eq!(info, json!({ "active": false }));
    }

    #[tokio::test]
    async fn openapi_document_lists_the_routes() {
        let app = app();
        let (status, doc) = call(&app, "GET", "/api-docs/openapi.json", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let paths = doc["paths"].as_object().unwrap();
        for p in ["/auth/login", "/auth/refresh", "/auth/me", "/auth/introspect"] {
            assert!(paths.contains_key(p), "{p}");
        }
        assert!(doc["components"]["securitySchemes"]["bearer"].is_object());
    }
}
