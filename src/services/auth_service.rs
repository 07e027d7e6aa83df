use std::{future::Future, sync::Arc, time::Duration as StdDuration};

use chrono::Duration;

use crate::{
    auth::{
        jwt::TokenCodec,
        tokens::{mint_pair, TokenPair},
    },
    clock::Clock,
    config::{Config, ConfigError},
    dto::auth::IntrospectResponse,
    errors::AuthError,
    models::{
        jwt::TokenType,
        user::{NewUser, ProfileUpdate, User, UserPublic},
    },
    password::CredentialHasher,
    store::{self, RefreshTokenStore, UserRepository},
};

pub const MIN_PASSWORD_CHARS: usize = 8;
const MAX_USERNAME_CHARS: usize = 64;

/// Owns every authentication rule: who may log in, which refresh token is
/// live, and when a session ends. Transport-agnostic.
#[derive(Clone)]
pub struct AuthService {
    codec: TokenCodec,
    hasher: Arc<CredentialHasher>,
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    store_timeout: StdDuration,
    /// Verified against when the account does not exist, so unknown users
    /// cost as much as wrong passwords.
    dummy_hash: Arc<str>,
}

impl AuthService {
    pub fn new(
        cfg: &Config,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let hasher = CredentialHasher::new(&cfg.hasher)?;
        let dummy_hash = hasher
            .hash("dummy-password-for-timing")
            .map_err(|e| ConfigError::Invalid {
                key: "PASSWORD_HASH_SCHEME",
                reason: e.to_string(),
            })?;

        let codec = TokenCodec::new(&cfg.tokens, clock.clone());
        tracing::debug!(
            algorithm = ?codec.algorithm(),
            primary_scheme = %cfg.hasher.primary,
            "auth service configured"
        );

        Ok(Self {
            codec,
            hasher: Arc::new(hasher),
            users,
            sessions,
            clock,
            access_ttl: cfg.tokens.access_ttl,
            refresh_ttl: cfg.tokens.refresh_ttl,
            store_timeout: cfg.store_timeout,
            dummy_hash: dummy_hash.into(),
        })
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<UserPublic, AuthError> {
        let email = normalize_email(email)?;
        let username = normalize_username(username)?;
        validate_password(password)?;

        let taken = self
            .read(|| self.users.exists(&email, &username))
            .await?;
        if taken {
            return Err(AuthError::DuplicateRegistration);
        }

        let password_hash = self.hash_password(password).await?;
        let new_user = NewUser {
            email,
            username,
            full_name: full_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            password_hash,
            created_at: self.clock.now(),
        };

        // a concurrent registration can still win the race; the store's
        // unique constraint reports it as Duplicate
        let user = self.timed(self.users.create(new_user)).await?;
        tracing::info!(user_id = user.id, username = %user.username, "user registered");
        Ok(user.into())
    }

    pub async fn authenticate(&self, login: &str, password: &str) -> Result<User, AuthError> {
        let login = login.trim();
        let found = self.read(|| self.users.find_by_login(login)).await?;

        let Some(mut user) = found else {
            let _ = self.verify_password(password, &self.dummy_hash).await;
            tracing::warn!("login rejected: unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify_password(password, &user.password_hash).await? {
            tracing::warn!(user_id = user.id, "login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            tracing::warn!(user_id = user.id, "login rejected: inactive account");
            return Err(AuthError::UserInactive);
        }

        if self.hasher.needs_rehash(&user.password_hash) {
            if let Some(upgraded) = self.upgrade_hash(&user, password).await {
                user.password_hash = upgraded;
            }
        }
        Ok(user)
    }

    /// Starts a new session for an authenticated user, superseding any previous one.
    pub async fn login(&self, user: &User) -> Result<TokenPair, AuthError> {
        let (pair, record) = mint_pair(&self.codec, user, self.access_ttl, self.refresh_ttl)?;
        self.timed(self.sessions.put(user.id, &record)).await?;
        tracing::info!(user_id = user.id, "user logged in");
        Ok(pair)
    }

    pub async fn login_with_password(
        &self,
        login: &str,
        password: &str,
    ) -> Result<TokenPair, AuthError> {
        let user = self.authenticate(login, password).await?;
        self.login(&user).await
    }

    /// Exchanges a live refresh token for a new pair. The presented token is
    /// consumed: of two concurrent calls with the same token only one wins.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.codec.decode_expecting(refresh_token, TokenType::Refresh)?;
        let user_id = parse_subject(&claims.sub)?;
        let fingerprint = claims
            .jti
            .filter(|jti| !jti.is_empty())
            .ok_or(AuthError::TokenMalformed)?;

        let user = self
            .read(|| self.users.find_by_id(user_id))
            .await?
            .ok_or(AuthError::RefreshTokenRevoked)?;
        if !user.is_active {
            return Err(AuthError::UserInactive);
        }

        let (pair, next) = mint_pair(&self.codec, &user, self.access_ttl, self.refresh_ttl)?;
        let now = self.clock.now();
        let rotated = self
            .timed(self.sessions.rotate_if_matches(user_id, &fingerprint, &next, now))
            .await?;
        if !rotated {
            tracing::warn!(user_id, "refresh rejected: token is not the live session");
            return Err(AuthError::RefreshTokenRevoked);
        }

        tracing::info!(user_id, "session refreshed");
        Ok(pair)
    }

    pub async fn logout(&self, user_id: i64) -> Result<(), AuthError> {
        self.timed(self.sessions.clear(user_id)).await?;
        tracing::info!(user_id, "user logged out");
        Ok(())
    }

    /// Ends the session a refresh token belongs to. A token that is no
    /// longer live is not an error.
    pub async fn revoke_refresh(&self, refresh_token: &str) -> Result<(), AuthError> {
        let claims = self.codec.decode_expecting(refresh_token, TokenType::Refresh)?;
        let user_id = parse_subject(&claims.sub)?;
        let fingerprint = claims
            .jti
            .filter(|jti| !jti.is_empty())
            .ok_or(AuthError::TokenMalformed)?;

        let now = self.clock.now();
        let cleared = self
            .timed(self.sessions.check_and_clear_if_matches(user_id, &fingerprint, now))
            .await?;
        if cleared {
            tracing::info!(user_id, "refresh token revoked");
        } else {
            tracing::debug!(user_id, "revocation matched no live session");
        }
        Ok(())
    }

    /// Stateless: signature, expiry and type only.
    pub fn verify_access(&self, access_token: &str) -> Result<i64, AuthError> {
        let claims = self.codec.decode_expecting(access_token, TokenType::Access)?;
        parse_subject(&claims.sub)
    }

    pub async fn current_user(&self, access_token: &str) -> Result<UserPublic, AuthError> {
        let user_id = self.verify_access(access_token)?;
        self.profile(user_id).await
    }

    pub async fn profile(&self, user_id: i64) -> Result<UserPublic, AuthError> {
        let user = self.load_active(user_id).await?;
        Ok(user.into())
    }

    /// Only `full_name` and `email` can change here; password and session are untouched.
    pub async fn update_profile(
        &self,
        user_id: i64,
        full_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<UserPublic, AuthError> {
        let update = ProfileUpdate {
            full_name: full_name.map(|n| n.trim().to_string()),
            email: email.map(normalize_email).transpose()?,
        };
        let current = self.load_active(user_id).await?;
        if update.is_empty() {
            return Ok(current.into());
        }

        let now = self.clock.now();
        let user = self
            .timed(self.users.update_profile(user_id, &update, now))
            .await?
            .ok_or(AuthError::UserNotFound)?;
        tracing::info!(user_id, "profile updated");
        Ok(user.into())
    }

    /// Replaces the password and ends the current session.
    pub async fn change_password(
        &self,
        user_id: i64,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        let user = self.load_active(user_id).await?;
        if !self.verify_password(current, &user.password_hash).await? {
            tracing::warn!(user_id, "password change rejected: wrong current password");
            return Err(AuthError::InvalidCredentials);
        }
        validate_password(new)?;

        let hash = self.hash_password(new).await?;
        let now = self.clock.now();
        if !self
            .timed(self.users.update_password_hash(user_id, &hash, now))
            .await?
        {
            return Err(AuthError::UserNotFound);
        }
        self.timed(self.sessions.clear(user_id)).await?;

        tracing::info!(user_id, "password changed, session cleared");
        Ok(())
    }

    /// Any token that fails to decode is simply inactive. Refresh tokens are
    /// only active while they are the user's live session.
    pub async fn introspect(&self, token: &str) -> Result<IntrospectResponse, AuthError> {
        let Ok(claims) = self.codec.decode(token.trim()) else {
            return Ok(IntrospectResponse::inactive());
        };

        if claims.typ == TokenType::Refresh {
            let (Ok(user_id), Some(jti)) = (parse_subject(&claims.sub), claims.jti.as_deref())
            else {
                return Ok(IntrospectResponse::inactive());
            };
            let now = self.clock.now();
            let live = self.read(|| self.sessions.current(user_id, now)).await?;
            if live.map_or(true, |record| record.fingerprint != jti) {
                return Ok(IntrospectResponse::inactive());
            }
        }

        Ok(IntrospectResponse {
            active: true,
            sub: Some(claims.sub),
            token_type: Some(claims.typ),
            exp: Some(claims.exp),
        })
    }

    async fn load_active(&self, user_id: i64) -> Result<User, AuthError> {
        let user = self
            .read(|| self.users.find_by_id(user_id))
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !user.is_active {
            return Err(AuthError::UserInactive);
        }
        Ok(user)
    }

    /// Best effort: a failed upgrade leaves the old hash in place.
    async fn upgrade_hash(&self, user: &User, password: &str) -> Option<String> {
        let hash = match self.hash_password(password).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(user_id = user.id, error = %e, "password rehash failed");
                return None;
            }
        };
        let now = self.clock.now();
        match self
            .timed(self.users.update_password_hash(user.id, &hash, now))
            .await
        {
            Ok(true) => {
                tracing::info!(user_id = user.id, "password hash upgraded");
                Some(hash)
            }
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(user_id = user.id, error = %e, "storing upgraded hash failed");
                None
            }
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))
    }

    /// Bounds a store call by the configured timeout.
    async fn timed<T>(
        &self,
        call: impl Future<Output = store::Result<T>>,
    ) -> Result<T, AuthError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(res) => res.map_err(AuthError::from),
            Err(_) => {
                tracing::warn!(timeout_ms = self.store_timeout.as_millis() as u64, "store call timed out");
                Err(AuthError::TransientStoreFailure)
            }
        }
    }

    /// Idempotent reads get one retry on a transient failure. Writes never go through here.
    async fn read<T, F, Fut>(&self, op: F) -> Result<T, AuthError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = store::Result<T>>,
    {
        match self.timed(op()).await {
            Err(AuthError::TransientStoreFailure) => {
                tracing::debug!("retrying store read after transient failure");
                self.timed(op()).await
            }
            other => other,
        }
    }
}

fn parse_subject(sub: &str) -> Result<i64, AuthError> {
    sub.parse().map_err(|_| AuthError::TokenMalformed)
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AuthError::Validation("invalid email address".into()));
    }
    Ok(email)
}

fn normalize_username(raw: &str) -> Result<String, AuthError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(AuthError::Validation("username is required".into()));
    }
    if username.chars().count() > MAX_USERNAME_CHARS {
        return Err(AuthError::Validation(format!(
            "username must be at most {MAX_USERNAME_CHARS} characters"
        )));
    }
    // '@' is reserved so a login name is never ambiguous with an email
    if username.contains('@') || username.chars().any(char::is_whitespace) {
        return Err(AuthError::Validation(
            "username must not contain '@' or whitespace".into(),
        ));
    }
    Ok(username.to_string())
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AuthError::Validation(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;
    use crate::{
        clock::ManualClock,
        config::test_config,
        errors::StoreError,
        models::{jwt::Claims, refresh_token::RefreshTokenRecord},
        store::memory::MemoryStore,
    };

    struct Harness {
        svc: AuthService,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let svc = AuthService::new(&test_config(), store.clone(), store.clone(), clock.clone())
            .unwrap();
        Harness { svc, store, clock }
    }

    async fn alice(h: &Harness) -> UserPublic {
        h.svc
            .register("Alice@Example.com ", "alice", "s3cretpass", Some("Alice"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_then_login_scenario() {
        let h = harness();
        let user = alice(&h).await;
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.username, "alice");
        assert!(user.is_active);
        assert!(!user.is_verified);

        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 15 * 60);
        assert_eq!(pair.refresh_expires_in, 30 * 24 * 60 * 60);
        assert_eq!(pair.user.id, user.id);

        assert_eq!(h.svc.verify_access(&pair.access_token), Ok(user.id));
        assert_eq!(h.svc.current_user(&pair.access_token).await.unwrap(), user);

        // email login is case-insensitive
        assert!(h
            .svc
            .login_with_password("ALICE@example.com", "s3cretpass")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn registration_validates_and_rejects_duplicates() {
        let h = harness();
        alice(&h).await;

        assert_eq!(
            h.svc.register("alice@example.com", "alice2", "s3cretpass", None).await,
            Err(AuthError::DuplicateRegistration)
        );
        assert_eq!(
            h.svc.register("other@example.com", "alice", "s3cretpass", None).await,
            Err(AuthError::DuplicateRegistration)
        );

        for (email, username, password) in [
            ("not-an-email", "bob", "s3cretpass"),
            ("bob@example.com", "  ", "s3cretpass"),
            ("bob@example.com", "bob", "short"),
            ("bob@example.com", "bob@home", "s3cretpass"),
        ] {
            assert!(
                matches!(
                    h.svc.register(email, username, password, None).await,
                    Err(AuthError::Validation(_))
                ),
                "{email} / {username}"
            );
        }
    }

    #[tokio::test]
    async fn bad_credentials_are_indistinguishable() {
        let h = harness();
        alice(&h).await;
        assert_eq!(
            h.svc.login_with_password("alice", "wrong-password").await.unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            h.svc.login_with_password("nobody", "s3cretpass").await.unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn inactive_users_are_told_only_after_a_correct_password() {
        let h = harness();
        let user = alice(&h).await;
        h.store.set_active(user.id, false);

        assert_eq!(
            h.svc.login_with_password("alice", "wrong-password").await.unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            h.svc.login_with_password("alice", "s3cretpass").await.unwrap_err(),
            AuthError::UserInactive
        );
    }

    #[tokio::test]
    async fn refresh_rotates_and_consumes_the_old_token() {
        let h = harness();
        alice(&h).await;
        let first = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        let second = h.svc.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        assert_eq!(
            h.svc.refresh(&first.refresh_token).await.unwrap_err(),
            AuthError::RefreshTokenRevoked
        );
        assert!(h.svc.refresh(&second.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn a_new_login_supersedes_the_previous_session() {
        let h = harness();
        alice(&h).await;
        let a = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        let b = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        assert_eq!(
            h.svc.refresh(&a.refresh_token).await.unwrap_err(),
            AuthError::RefreshTokenRevoked
        );
        assert!(h.svc.refresh(&b.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn logout_clears_the_session_and_is_idempotent() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        h.svc.logout(user.id).await.unwrap();
        h.svc.logout(user.id).await.unwrap();
        assert_eq!(
            h.svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AuthError::RefreshTokenRevoked
        );
        // access tokens are stateless and live until they expire
        assert_eq!(h.svc.verify_access(&pair.access_token), Ok(user.id));
    }

    #[tokio::test]
    async fn revoke_ends_only_the_matching_session() {
        let h = harness();
        alice(&h).await;
        let old = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        let live = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        // stale token: no error, live session untouched
        h.svc.revoke_refresh(&old.refresh_token).await.unwrap();
        let live = h.svc.refresh(&live.refresh_token).await.unwrap();

        h.svc.revoke_refresh(&live.refresh_token).await.unwrap();
        h.svc.revoke_refresh(&live.refresh_token).await.unwrap();
        assert_eq!(
            h.svc.refresh(&live.refresh_token).await.unwrap_err(),
            AuthError::RefreshTokenRevoked
        );
        assert_eq!(
            h.svc.revoke_refresh(&live.access_token).await.unwrap_err(),
            AuthError::TokenTypeMismatch
        );
    }

    #[tokio::test]
    async fn token_types_are_not_interchangeable() {
        let h = harness();
        alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        assert_eq!(
            h.svc.refresh(&pair.access_token).await.unwrap_err(),
            AuthError::TokenTypeMismatch
        );
        assert_eq!(
            h.svc.verify_access(&pair.refresh_token),
            Err(AuthError::TokenTypeMismatch)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_have_exactly_one_winner() {
        let h = harness();
        alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        let (a, b) = tokio::join!(
            h.svc.refresh(&pair.refresh_token),
            h.svc.refresh(&pair.refresh_token)
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| r.as_ref().err() == Some(&AuthError::RefreshTokenRevoked)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_racing_logout_never_leaves_a_session_behind_logout() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        let (refreshed, _) = tokio::join!(h.svc.refresh(&pair.refresh_token), h.svc.logout(user.id));
        let now = h.clock.now();
        let live = h.store.current(user.id, now).await.unwrap();
        match refreshed {
            // rotation first, then logout cleared it
            Ok(_) => assert!(live.is_none()),
            Err(e) => {
                assert_eq!(e, AuthError::RefreshTokenRevoked);
                assert!(live.is_none());
            }
        }
    }

    #[tokio::test]
    async fn tokens_expire_on_the_injected_clock() {
        let h = harness();
        alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        h.clock.advance(Duration::minutes(15));
        assert_eq!(
            h.svc.verify_access(&pair.access_token),
            Err(AuthError::TokenExpired)
        );
        assert!(h.svc.refresh(&pair.refresh_token).await.is_ok());

        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        h.clock.advance(Duration::days(30));
        assert_eq!(
            h.svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AuthError::TokenExpired
        );
    }

    #[tokio::test]
    async fn refresh_for_a_deactivated_user_is_refused() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        h.store.set_active(user.id, false);
        assert_eq!(
            h.svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AuthError::UserInactive
        );
        assert_eq!(
            h.svc.current_user(&pair.access_token).await.unwrap_err(),
            AuthError::UserInactive
        );
    }

    #[tokio::test]
    async fn deactivated_users_cannot_edit_their_profile() {
        let h = harness();
        let user = alice(&h).await;
        h.store.set_active(user.id, false);

        assert_eq!(
            h.svc
                .update_profile(user.id, None, Some("mallory@example.com"))
                .await,
            Err(AuthError::UserInactive)
        );
        assert_eq!(
            h.svc.update_profile(user.id, None, None).await,
            Err(AuthError::UserInactive)
        );
        let stored = h.store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.email, "alice@example.com");
    }

    fn forge_refresh_without_fingerprint(h: &Harness, sub: &str, jti: Option<&str>) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (h.clock.now() + Duration::hours(1)).timestamp(),
            iat: h.clock.now().timestamp(),
            typ: TokenType::Refresh,
            jti: jti.map(str::to_string),
            extra: Default::default(),
        };
        let cfg = test_config();
        jsonwebtoken::encode(
            &Header::new(cfg.tokens.algorithm),
            &claims,
            &EncodingKey::from_secret(cfg.tokens.secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_tokens_without_a_fingerprint_are_malformed() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();
        let sub = user.id.to_string();

        for jti in [None, Some("")] {
            let token = forge_refresh_without_fingerprint(&h, &sub, jti);
            assert_eq!(h.svc.refresh(&token).await.unwrap_err(), AuthError::TokenMalformed);
            assert_eq!(
                h.svc.revoke_refresh(&token).await.unwrap_err(),
                AuthError::TokenMalformed
            );
        }
        // the real session is untouched
        assert!(h.svc.refresh(&pair.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn changing_the_password_ends_the_session() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        assert_eq!(
            h.svc.change_password(user.id, "wrong-password", "n3w-passw0rd").await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(matches!(
            h.svc.change_password(user.id, "s3cretpass", "short").await,
            Err(AuthError::Validation(_))
        ));

        h.svc
            .change_password(user.id, "s3cretpass", "n3w-passw0rd")
            .await
            .unwrap();
        assert_eq!(
            h.svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AuthError::RefreshTokenRevoked
        );
        assert_eq!(
            h.svc.login_with_password("alice", "s3cretpass").await.unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert!(h.svc.login_with_password("alice", "n3w-passw0rd").await.is_ok());
    }

    #[tokio::test]
    async fn profile_updates_touch_only_name_and_email() {
        let h = harness();
        let user = alice(&h).await;
        h.svc.register("bob@example.com", "bob", "s3cretpass", None).await.unwrap();
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        let updated = h
            .svc
            .update_profile(user.id, Some(" Alice Liddell "), Some("Alice@Wonder.land"))
            .await
            .unwrap();
        assert_eq!(updated.full_name.as_deref(), Some("Alice Liddell"));
        assert_eq!(updated.email, "alice@wonder.land");
        assert_eq!(updated.username, "alice");

        assert_eq!(
            h.svc.update_profile(user.id, None, Some("bob@example.com")).await,
            Err(AuthError::DuplicateRegistration)
        );
        assert!(matches!(
            h.svc.update_profile(user.id, None, Some("nope")).await,
            Err(AuthError::Validation(_))
        ));
        assert_eq!(
            h.svc.update_profile(999, Some("x"), None).await,
            Err(AuthError::UserNotFound)
        );

        // session and password survive
        assert!(h.svc.refresh(&pair.refresh_token).await.is_ok());
        assert!(h.svc.login_with_password("alice", "s3cretpass").await.is_ok());
    }

    #[tokio::test]
    async fn legacy_bcrypt_hashes_are_upgraded_on_login() {
        let h = harness();
        let user = alice(&h).await;
        h.store
            .set_password_hash(user.id, &bcrypt::hash("s3cretpass", 4).unwrap());

        let logged_in = h.svc.authenticate("alice", "s3cretpass").await.unwrap();
        assert!(logged_in.password_hash.starts_with("$argon2id$"));

        let stored = h.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.password_hash.starts_with("$argon2id$"));
        assert!(h.svc.login_with_password("alice", "s3cretpass").await.is_ok());
    }

    #[tokio::test]
    async fn introspection_reflects_session_state() {
        let h = harness();
        let user = alice(&h).await;
        let pair = h.svc.login_with_password("alice", "s3cretpass").await.unwrap();

        let access = h.svc.introspect(&pair.access_token).await.unwrap();
        assert!(access.active);
        assert_eq!(access.sub, Some(user.id.to_string()));
        assert_eq!(access.token_type, Some(TokenType::Access));

        let refresh = h.svc.introspect(&pair.refresh_token).await.unwrap();
        assert!(refresh.active);
        assert_eq!(refresh.token_type, Some(TokenType::Refresh));

        h.svc.logout(user.id).await.unwrap();
        assert!(!h.svc.introspect(&pair.refresh_token).await.unwrap().active);
        assert_eq!(
            h.svc.introspect("garbage").await.unwrap(),
            IntrospectResponse::inactive()
        );
    }

    /// Wraps the memory store with injectable failures and delays.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        read_failures: AtomicUsize,
        fail_writes: AtomicBool,
        write_calls: AtomicUsize,
        slow_reads: AtomicBool,
    }

    impl FlakyStore {
        async fn before_read(&self) -> store::Result<()> {
            if self.slow_reads.load(Ordering::SeqCst) {
                tokio::time::sleep(StdDuration::from_secs(5)).await;
            }
            let left = self.read_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.read_failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            Ok(())
        }

        fn before_write(&self) -> store::Result<()> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl UserRepository for FlakyStore {
        async fn find_by_id(&self, id: i64) -> store::Result<Option<User>> {
            self.before_read().await?;
            self.inner.find_by_id(id).await
        }

        async fn find_by_login(&self, login: &str) -> store::Result<Option<User>> {
            self.before_read().await?;
            self.inner.find_by_login(login).await
        }

        async fn exists(&self, email: &str, username: &str) -> store::Result<bool> {
            self.before_read().await?;
            self.inner.exists(email, username).await
        }

        async fn create(&self, new_user: NewUser) -> store::Result<User> {
            self.before_write()?;
            self.inner.create(new_user).await
        }

        async fn update_profile(
            &self,
            id: i64,
            update: &ProfileUpdate,
            now: DateTime<Utc>,
        ) -> store::Result<Option<User>> {
            self.before_write()?;
            self.inner.update_profile(id, update, now).await
        }

        async fn update_password_hash(
            &self,
            id: i64,
            hash: &str,
            now: DateTime<Utc>,
        ) -> store::Result<bool> {
            self.before_write()?;
            self.inner.update_password_hash(id, hash, now).await
        }
    }

    #[async_trait]
    impl RefreshTokenStore for FlakyStore {
        async fn put(&self, user_id: i64, record: &RefreshTokenRecord) -> store::Result<()> {
            self.before_write()?;
            self.inner.put(user_id, record).await
        }

        async fn check_and_clear_if_matches(
            &self,
            user_id: i64,
            fingerprint: &str,
            now: DateTime<Utc>,
        ) -> store::Result<bool> {
            self.before_write()?;
            self.inner.check_and_clear_if_matches(user_id, fingerprint, now).await
        }

        async fn rotate_if_matches(
            &self,
            user_id: i64,
            fingerprint: &str,
            next: &RefreshTokenRecord,
            now: DateTime<Utc>,
        ) -> store::Result<bool> {
            self.before_write()?;
            self.inner.rotate_if_matches(user_id, fingerprint, next, now).await
        }

        async fn clear(&self, user_id: i64) -> store::Result<()> {
            self.before_write()?;
            self.inner.clear(user_id).await
        }

        async fn current(
            &self,
            user_id: i64,
            now: DateTime<Utc>,
        ) -> store::Result<Option<RefreshTokenRecord>> {
            self.before_read().await?;
            self.inner.current(user_id, now).await
        }
    }

    async fn flaky_harness() -> (AuthService, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let svc = AuthService::new(&test_config(), store.clone(), store.clone(), clock).unwrap();
        svc.register("carol@example.com", "carol", "s3cretpass", None)
            .await
            .unwrap();
        (svc, store)
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried_once() {
        let (svc, store) = flaky_harness().await;

        store.read_failures.store(1, Ordering::SeqCst);
        assert!(svc.login_with_password("carol", "s3cretpass").await.is_ok());

        store.read_failures.store(2, Ordering::SeqCst);
        assert_eq!(
            svc.login_with_password("carol", "s3cretpass").await.unwrap_err(),
            AuthError::TransientStoreFailure
        );
    }

    #[tokio::test]
    async fn failed_writes_are_not_retried() {
        let (svc, store) = flaky_harness().await;
        let user = svc.authenticate("carol", "s3cretpass").await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let before = store.write_calls.load(Ordering::SeqCst);
        assert_eq!(
            svc.login(&user).await.unwrap_err(),
            AuthError::TransientStoreFailure
        );
        assert_eq!(svc.logout(user.id).await, Err(AuthError::TransientStoreFailure));
        assert_eq!(store.write_calls.load(Ordering::SeqCst) - before, 2);
    }

    #[tokio::test]
    async fn slow_stores_surface_as_transient_failures() {
        let (svc, store) = flaky_harness().await;
        store.slow_reads.store(true, Ordering::SeqCst);
        assert_eq!(
            svc.login_with_password("carol", "s3cretpass").await.unwrap_err(),
            AuthError::TransientStoreFailure
        );
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Bob@Example.COM ").unwrap(), "bob@example.com");
        for bad in ["", "bob", "@example.com", "bob@", "bob@example", "bob@.com", "b ob@x.io"] {
            assert!(normalize_email(bad).is_err(), "{bad:?}");
        }
    }
}
