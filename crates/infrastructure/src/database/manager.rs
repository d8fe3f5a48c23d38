use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{DatabaseConfig, SchedulerResult};
use scheduler_domain::{
    AclRepository, HostQueueEntryRepository, HostRepository, IneligibleHostRepository,
    JobRepository, LabelRepository, SpecialTaskRepository,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::schema::run_migrations;
use super::sqlite::{
    SqliteAclRepository, SqliteHostQueueEntryRepository, SqliteHostRepository,
    SqliteIneligibleHostRepository, SqliteJobRepository, SqliteLabelRepository,
    SqliteSpecialTaskRepository,
};

/// 数据库管理器：持有连接池并负责创建各仓储
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置连接数据库并初始化表结构
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        debug!("Connecting to SQLite database: {}", config.url);

        // 启用外键约束和WAL模式
        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        run_migrations(&pool).await?;
        info!("数据库已就绪: {}", config.url);
        Ok(Self { pool })
    }

    /// 内存数据库，主要用于测试
    pub async fn in_memory() -> SchedulerResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // 内存数据库每个连接都是独立的库，只能使用单连接
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        run_migrations(&self.pool).await
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(SqliteJobRepository::new(self.pool.clone()))
    }

    pub fn queue_entry_repository(&self) -> Arc<dyn HostQueueEntryRepository> {
        Arc::new(SqliteHostQueueEntryRepository::new(self.pool.clone()))
    }

    pub fn host_repository(&self) -> Arc<dyn HostRepository> {
        Arc::new(SqliteHostRepository::new(self.pool.clone()))
    }

    pub fn label_repository(&self) -> Arc<dyn LabelRepository> {
        Arc::new(SqliteLabelRepository::new(self.pool.clone()))
    }

    pub fn acl_repository(&self) -> Arc<dyn AclRepository> {
        Arc::new(SqliteAclRepository::new(self.pool.clone()))
    }

    pub fn ineligible_host_repository(&self) -> Arc<dyn IneligibleHostRepository> {
        Arc::new(SqliteIneligibleHostRepository::new(self.pool.clone()))
    }

    pub fn special_task_repository(&self) -> Arc<dyn SpecialTaskRepository> {
        Arc::new(SqliteSpecialTaskRepository::new(self.pool.clone()))
    }
}
