//! Database connection and per-table repository accessors.

pub mod approvals;
pub mod jobs;
pub mod processing_items;
pub mod requests;
pub mod settings;
pub mod sync_state;
pub mod workers;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use approvals::ApprovalRepository;
pub use jobs::JobRepository;
pub use processing_items::ProcessingItemRepository;
pub use requests::RequestRepository;
pub use settings::SettingsRepository;
pub use sync_state::SyncStateRepository;
pub use workers::WorkerRepository;

/// Database wrapper providing connection pool access.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    pub fn workers(&self) -> WorkerRepository {
        WorkerRepository::new(self.pool.clone())
    }

    pub fn requests(&self) -> RequestRepository {
        RequestRepository::new(self.pool.clone())
    }

    pub fn processing_items(&self) -> ProcessingItemRepository {
        ProcessingItemRepository::new(self.pool.clone())
    }

    pub fn approvals(&self) -> ApprovalRepository {
        ApprovalRepository::new(self.pool.clone())
    }

    pub fn sync_state(&self) -> SyncStateRepository {
        SyncStateRepository::new(self.pool.clone())
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}
