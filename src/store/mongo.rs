//! MongoDB backend. The refresh session lives on the user document
//! (`refresh_jti` / `refresh_expires_at`), so every session operation is a
//! single-document update and therefore atomic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions, ReturnDocument},
    Client, Collection, IndexModel,
};
use serde::{Deserialize, Serialize};

use super::{RefreshTokenStore, Result, UserRepository};
use crate::{
    errors::StoreError,
    models::{
        refresh_token::RefreshTokenRecord,
        user::{NewUser, ProfileUpdate, User},
    },
};

const DUPLICATE_KEY: i32 = 11000;
const USER_SEQUENCE: &str = "users";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDoc {
    #[serde(rename = "_id")]
    id: i64,

    email: String,
    username: String,
    full_name: Option<String>,

    password_hash: String,
    is_active: bool,
    is_verified: bool,

    refresh_jti: Option<String>,
    refresh_expires_at: Option<BsonDateTime>,

    created_at: BsonDateTime,
    updated_at: BsonDateTime,
}

impl From<UserDoc> for User {
    fn from(d: UserDoc) -> Self {
        let refresh = match (d.refresh_jti, d.refresh_expires_at) {
            (Some(fingerprint), Some(expires_at)) => Some(RefreshTokenRecord {
                fingerprint,
                expires_at: from_bson(expires_at),
            }),
            _ => None,
        };
        Self {
            id: d.id,
            email: d.email,
            username: d.username,
            full_name: d.full_name,
            password_hash: d.password_hash,
            is_active: d.is_active,
            is_verified: d.is_verified,
            refresh,
            created_at: from_bson(d.created_at),
            updated_at: from_bson(d.updated_at),
        }
    }
}

fn to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

fn from_bson(dt: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or_default()
}

impl From<MongoError> for StoreError {
    fn from(e: MongoError) -> Self {
        match e.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY => {
                StoreError::Duplicate
            }
            ErrorKind::Command(ce) if ce.code == DUPLICATE_KEY => StoreError::Duplicate,
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct MongoStore {
    users: Collection<UserDoc>,
    counters: Collection<Document>,
}

impl MongoStore {
    pub async fn connect(uri: &str, db_name: &str, timeout: Duration) -> Result<Self> {
        let mut opts = ClientOptions::parse(uri).await?;
        opts.app_name = Some("ledger-auth".to_string());
        opts.connect_timeout = Some(timeout);
        opts.server_selection_timeout = Some(timeout);

        let client = Client::with_options(opts)?;
        let db = client.database(db_name);
        let users: Collection<UserDoc> = db.collection("users");
        let counters: Collection<Document> = db.collection("counters");

        for key in ["email", "username"] {
            let mut keys = Document::new();
            keys.insert(key, 1_i32);
            let index = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build();
            users.create_index(index).await?;
        }

        tracing::info!(db = db_name, "connected to mongodb");
        Ok(Self { users, counters })
    }

    async fn next_user_id(&self) -> Result<i64> {
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "_id": USER_SEQUENCE },
                doc! { "$inc": { "seq": 1_i64 } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| StoreError::Backend("user id counter missing after upsert".into()))?;

        counter
            .get_i64("seq")
            .map_err(|e| StoreError::Backend(format!("user id counter: {e}")))
    }

    /// Matches only a live session carrying `fingerprint`.
    fn live_session(user_id: i64, fingerprint: &str, now: DateTime<Utc>) -> Document {
        doc! {
            "_id": user_id,
            "refresh_jti": fingerprint,
            "refresh_expires_at": { "$gt": to_bson(now) },
        }
    }
}

#[async_trait]
impl UserRepository for MongoStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self
            .users
            .find_one(doc! { "_id": id })
            .await?
            .map(User::from))
    }

    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        let filter = doc! {
            "$or": [
                { "username": login },
                { "email": login.to_lowercase() },
            ]
        };
        Ok(self.users.find_one(filter).await?.map(User::from))
    }

    async fn exists(&self, email: &str, username: &str) -> Result<bool> {
        let filter = doc! { "$or": [ { "email": email }, { "username": username } ] };
        Ok(self.users.find_one(filter).await?.is_some())
    }

    async fn create(&self, new_user: NewUser) -> Result<User> {
        let id = self.next_user_id().await?;
        let created_at = to_bson(new_user.created_at);
        let user = UserDoc {
            id,
            email: new_user.email,
            username: new_user.username,
            full_name: new_user.full_name,
            password_hash: new_user.password_hash,
            is_active: true,
            is_verified: false,
            refresh_jti: None,
            refresh_expires_at: None,
            created_at,
            updated_at: created_at,
        };

        self.users.insert_one(&user).await?;
        Ok(user.into())
    }

    async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let mut set = doc! { "updated_at": to_bson(now) };
        if let Some(email) = &update.email {
            set.insert("email", email.as_str());
        }
        if let Some(full_name) = &update.full_name {
            let value = if full_name.is_empty() {
                Bson::Null
            } else {
                Bson::String(full_name.clone())
            };
            set.insert("full_name", value);
        }

        Ok(self
            .users
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": set })
            .return_document(ReturnDocument::After)
            .await?
            .map(User::from))
    }

    async fn update_password_hash(
        &self,
        id: i64,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = self
            .users
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "password_hash": hash, "updated_at": to_bson(now) } },
            )
            .await?;
        Ok(res.matched_count == 1)
    }
}

#[async_trait]
impl RefreshTokenStore for MongoStore {
    async fn put(&self, user_id: i64, record: &RefreshTokenRecord) -> Result<()> {
        self.users
            .update_one(
                doc! { "_id": user_id },
                doc! { "$set": {
                    "refresh_jti": &record.fingerprint,
                    "refresh_expires_at": to_bson(record.expires_at),
                } },
            )
            .await?;
        Ok(())
    }

    async fn check_and_clear_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = self
            .users
            .update_one(
                Self::live_session(user_id, fingerprint, now),
                doc! { "$set": { "refresh_jti": Bson::Null, "refresh_expires_at": Bson::Null } },
            )
            .await?;
        Ok(res.matched_count == 1)
    }

    async fn rotate_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = self
            .users
            .update_one(
                Self::live_session(user_id, fingerprint, now),
                doc! { "$set": {
                    "refresh_jti": &next.fingerprint,
                    "refresh_expires_at": to_bson(next.expires_at),
                } },
            )
            .await?;
        Ok(res.matched_count == 1)
    }

    async fn clear(&self, user_id: i64) -> Result<()> {
        self.users
            .update_one(
                doc! { "_id": user_id },
                doc! { "$set": { "refresh_jti": Bson::Null, "refresh_expires_at": Bson::Null } },
            )
            .await?;
        Ok(())
    }

    async fn current(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>> {
        let user = self.users.find_one(doc! { "_id": user_id }).await?;
        Ok(user
            .and_then(|d| User::from(d).refresh)
            .filter(|record| record.is_live(now)))
    }
}
