//! Persistent key/value stores for the plughost runtime.
//!
//! A [`StoreHub`] is one logical database. Each named [`Store`] inside it is
//! handed out immediately and connects in the background: every store name
//! requested before the hub's connection task runs is created in a single
//! schema upgrade, then each store loads its persisted entries, replays the
//! mutations made while it was disconnected and runs its ready callbacks.

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::env;
use std::time::Duration;

pub mod backend;
pub mod entities;
pub mod error;
pub mod hub;
pub mod sea_backend;
pub mod store;
pub mod value;

pub use backend::{MemoryBackend, StoreBackend};
pub use error::StoreError;
pub use hub::StoreHub;
pub use sea_backend::SeaOrmBackend;
pub use store::{Entries, Store, StoreSnapshot};

/// Re-export for convenience
pub use sea_orm;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://plughost.db?mode=rwc".to_string());

        Self {
            url,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            connect_timeout_secs: env::var("DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            idle_timeout_secs: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }
}

/// Connect to the database and return a connection pool
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(&config.url);
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    Database::connect(opt).await
}
