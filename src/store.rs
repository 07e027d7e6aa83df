//! Persistence seams for the auth service.
//!
//! Both traits are keyed by user id. Refresh-session operations must be atomic per user:
//! `check_and_clear_if_matches` and `rotate_if_matches` are single compare-and-swap steps, so two
//! requests presenting the same refresh token can never both observe a match.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    errors::StoreError,
    models::{
        refresh_token::RefreshTokenRecord,
        user::{NewUser, ProfileUpdate, User},
    },
};

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Matches `login` against the username, or against the email case-insensitively.
    async fn find_by_login(&self, login: &str) -> Result<Option<User>>;

    async fn exists(&self, email: &str, username: &str) -> Result<bool>;

    /// Fails with `StoreError::Duplicate` when the email or username is taken.
    async fn create(&self, new_user: NewUser) -> Result<User>;

    /// Returns `None` if the user does not exist. Fails with `StoreError::Duplicate` when the
    /// new email belongs to someone else.
    async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<User>>;

    async fn update_password_hash(&self, id: i64, hash: &str, now: DateTime<Utc>)
        -> Result<bool>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Unconditionally replaces the user's refresh session.
    async fn put(&self, user_id: i64, record: &RefreshTokenRecord) -> Result<()>;

    /// Clears the session iff it is live and carries `fingerprint`.
    async fn check_and_clear_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Replaces the session with `next` iff it is live and carries `fingerprint`.
    async fn rotate_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn clear(&self, user_id: i64) -> Result<()>;

    async fn current(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<RefreshTokenRecord>>;
}
