use std::sync::Arc;

use thiserror::Error;

use crate::{
    clock::{Clock, SystemClock},
    config::{Config, ConfigError},
    errors::StoreError,
    services::auth_service::AuthService,
    store::{memory::MemoryStore, mongo::MongoStore, RefreshTokenStore, UserRepository},
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not open the credential store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
}

impl AppState {
    pub async fn new(cfg: &Config) -> Result<Self, InitError> {
        let (users, sessions): (Arc<dyn UserRepository>, Arc<dyn RefreshTokenStore>) =
            match &cfg.mongodb_uri {
                Some(uri) => {
                    let store = Arc::new(
                        MongoStore::connect(uri, &cfg.db_name, cfg.store_timeout).await?,
                    );
                    let users: Arc<dyn UserRepository> = store.clone();
                    let sessions: Arc<dyn RefreshTokenStore> = store;
                    (users, sessions)
                }
                None => {
                    tracing::warn!(
                        "MONGODB_URI is not set; using the in-memory store, data is lost on restart"
                    );
                    let store = Arc::new(MemoryStore::new());
                    let users: Arc<dyn UserRepository> = store.clone();
                    let sessions: Arc<dyn RefreshTokenStore> = store;
                    (users, sessions)
                }
            };

        Self::with_stores(cfg, users, sessions, Arc::new(SystemClock))
    }

    pub fn with_stores(
        cfg: &Config,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InitError> {
        let auth = AuthService::new(cfg, users, sessions, clock)?;
        Ok(Self { auth })
    }
}
