//! # courier-db
//!
//! Storage layer for the courier notification subsystem.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for notifications, delivery attempts,
//!   templates, preferences, rate windows, and campaigns
//! - A user directory over the `user_contacts` read model
//! - An in-memory store with the same semantics, used by tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_db::{Database, NotificationRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/courier").await?;
//!     let unread = db.notifications.unread_count(user_id, chrono::Utc::now()).await?;
//!     println!("{unread} unread");
//!     Ok(())
//! }
//! ```

pub mod campaigns;
pub mod delivery_logs;
pub mod directory;
pub mod memory;
pub mod notifications;
pub mod pool;
pub mod preferences;
pub mod rate_limits;
pub mod templates;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use courier_core::*;

pub use campaigns::PgCampaignRepository;
pub use delivery_logs::PgDeliveryLogRepository;
pub use directory::PgUserDirectory;
pub use memory::{MemoryStore, StaticDirectory};
pub use notifications::PgNotificationRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use preferences::PgPreferenceRepository;
pub use rate_limits::PgRateLimitRepository;
pub use templates::PgTemplateRepository;

/// Map a unique-constraint violation to `Error::Duplicate`.
pub(crate) fn unique_violation(e: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            Error::Duplicate(what())
        }
        _ => Error::Database(e),
    }
}

pub(crate) fn channels_to_strings(channels: &[Channel]) -> Vec<String> {
    channels.iter().map(|c| c.as_str().to_string()).collect()
}

/// Decode a stored channel list; unknown names mean corrupted state.
pub(crate) fn parse_channels(names: Vec<String>) -> Result<Vec<Channel>> {
    names
        .iter()
        .map(|n| {
            n.parse::<Channel>()
                .map_err(|e| Error::Serialization(e.to_string()))
        })
        .collect()
}

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub notifications: PgNotificationRepository,
    /// Append-only delivery attempt log.
    pub delivery_logs: PgDeliveryLogRepository,
    pub templates: PgTemplateRepository,
    pub preferences: PgPreferenceRepository,
    /// Fixed-window counters shared by every dispatcher instance.
    pub rate_limits: PgRateLimitRepository,
    pub campaigns: PgCampaignRepository,
    /// Read model of the user service.
    pub directory: PgUserDirectory,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            notifications: PgNotificationRepository::new(pool.clone()),
            delivery_logs: PgDeliveryLogRepository::new(pool.clone()),
            templates: PgTemplateRepository::new(pool.clone()),
            preferences: PgPreferenceRepository::new(pool.clone()),
            rate_limits: PgRateLimitRepository::new(pool.clone()),
            campaigns: PgCampaignRepository::new(pool.clone()),
            directory: PgUserDirectory::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

/// Repository handles as trait objects, shared by the services and jobs.
///
/// Built from a [`Database`] in production and from a [`MemoryStore`] in
/// tests; callers never see which one they got.
#[derive(Clone)]
pub struct Repositories {
    pub notifications: Arc<dyn NotificationRepository>,
    pub delivery_logs: Arc<dyn DeliveryLogRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub preferences: Arc<dyn PreferenceRepository>,
    pub rate_limits: Arc<dyn RateLimitRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
}

impl From<&Database> for Repositories {
    fn from(db: &Database) -> Self {
        Self {
            notifications: Arc::new(db.notifications.clone()),
            delivery_logs: Arc::new(db.delivery_logs.clone()),
            templates: Arc::new(db.templates.clone()),
            preferences: Arc::new(db.preferences.clone()),
            rate_limits: Arc::new(db.rate_limits.clone()),
            campaigns: Arc::new(db.campaigns.clone()),
        }
    }
}

impl From<&MemoryStore> for Repositories {
    fn from(store: &MemoryStore) -> Self {
        Self {
            notifications: Arc::new(store.clone()),
            delivery_logs: Arc::new(store.clone()),
            templates: Arc::new(store.clone()),
            preferences: Arc::new(store.clone()),
            rate_limits: Arc::new(store.clone()),
            campaigns: Arc::new(store.clone()),
        }
    }
}
