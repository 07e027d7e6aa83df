//! In-process store. Each user sits behind its own mutex, so refresh-session
//! operations for different users never contend; the outer map lock is only
//! taken for writing when users are created or emails change.
//!
//! Lock order is always map, then user.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{RefreshTokenStore, Result, UserRepository};
use crate::{
    errors::StoreError,
    models::{
        refresh_token::RefreshTokenRecord,
        user::{NewUser, ProfileUpdate, User},
    },
};

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<i64, Arc<Mutex<User>>>>,
    last_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: i64) -> Option<Arc<Mutex<User>>> {
        self.users.read().get(&id).cloned()
    }

    #[cfg(test)]
    pub fn set_active(&self, id: i64, active: bool) {
        if let Some(slot) = self.slot(id) {
            slot.lock().is_active = active;
        }
    }

    #[cfg(test)]
    pub fn set_password_hash(&self, id: i64, hash: &str) {
        if let Some(slot) = self.slot(id) {
            slot.lock().password_hash = hash.to_string();
        }
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self.slot(id).map(|u| u.lock().clone()))
    }

    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        let email = login.to_lowercase();
        let users = self.users.read();
        Ok(users
            .values()
            .map(|slot| slot.lock())
            .find(|u| u.username == login || u.email == email)
            .map(|u| User::clone(&u)))
    }

    async fn exists(&self, email: &str, username: &str) -> Result<bool> {
        let users = self.users.read();
        Ok(users.values().any(|slot| {
            let u = slot.lock();
            u.email == email || u.username == username
        }))
    }

    async fn create(&self, new_user: NewUser) -> Result<User> {
        let mut users = self.users.write();
        let taken = users.values().any(|slot| {
            let u = slot.lock();
            u.email == new_user.email || u.username == new_user.username
        });
        if taken {
            return Err(StoreError::Duplicate);
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let user = User {
            id,
            email: new_user.email,
            username: new_user.username,
            full_name: new_user.full_name,
            password_hash: new_user.password_hash,
            is_active: true,
            is_verified: false,
            refresh: None,
            created_at: new_user.created_at,
            updated_at: new_user.created_at,
        };
        users.insert(id, Arc::new(Mutex::new(user.clone())));
        Ok(user)
    }

    async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        // write lock keeps a concurrent create from grabbing the same email
        let users = self.users.write();
        let Some(slot) = users.get(&id) else {
            return Ok(None);
        };

        if let Some(email) = &update.email {
            let taken = users
                .iter()
                .filter(|(other, _)| **other != id)
                .any(|(_, slot)| slot.lock().email == *email);
            if taken {
                return Err(StoreError::Duplicate);
            }
        }

        let mut user = slot.lock();
        if let Some(email) = &update.email {
            user.email = email.clone();
        }
        if let Some(full_name) = &update.full_name {
            user.full_name = Some(full_name.clone()).filter(|n| !n.is_empty());
        }
        user.updated_at = now;
        Ok(Some(user.clone()))
    }

    async fn update_password_hash(
        &self,
        id: i64,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(slot) = self.slot(id) else {
            return Ok(false);
        };
        let mut user = slot.lock();
        user.password_hash = hash.to_string();
        user.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn put(&self, user_id: i64, record: &RefreshTokenRecord) -> Result<()> {
        if let Some(slot) = self.slot(user_id) {
            slot.lock().refresh = Some(record.clone());
        }
        Ok(())
    }

    async fn check_and_clear_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(slot) = self.slot(user_id) else {
            return Ok(false);
        };
        let mut user = slot.lock();
        match &user.refresh {
            Some(current) if current.matches(fingerprint, now) => {
                user.refresh = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate_if_matches(
        &self,
        user_id: i64,
        fingerprint: &str,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(slot) = self.slot(user_id) else {
            return Ok(false);
        };
        let mut user = slot.lock();
        match &user.refresh {
            Some(current) if current.matches(fingerprint, now) => {
                user.refresh = Some(next.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear(&self, user_id: i64) -> Result<()> {
        if let Some(slot) = self.slot(user_id) {
            slot.lock().refresh = None;
        }
        Ok(())
    }

    async fn current(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.slot(user_id).and_then(|slot| {
            slot.lock()
                .refresh
                .clone()
                .filter(|record| record.is_live(now))
        }))
    }
}
