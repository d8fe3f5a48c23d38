use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::Host, repositories::HostRepository, HostStatus};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const HOST_COLUMNS: &str = "hosts.id, hosts.hostname, hosts.locked, hosts.invalid, \
     hosts.protection, hosts.dirty, hosts.status";

pub struct SqliteHostRepository {
    pool: SqlitePool,
}

impl SqliteHostRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_host(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Host> {
        Ok(Host {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            locked: row.try_get("locked")?,
            invalid: row.try_get("invalid")?,
            protection: row.try_get("protection")?,
            dirty: row.try_get("dirty")?,
            status: row.try_get("status")?,
        })
    }
}

#[async_trait]
impl HostRepository for SqliteHostRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Host>> {
        let sql = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_host).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Host>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE id IN ({}) ORDER BY id",
            MappingHelpers::placeholders(ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_host).collect()
    }

    #[instrument(skip(self))]
    async fn find_ready(&self) -> SchedulerResult<Vec<Host>> {
        // 排除当前有活跃条目的主机
        let sql = format!(
            r#"
            SELECT {HOST_COLUMNS} FROM hosts
            LEFT JOIN host_queue_entries AS active_hqe
                ON hosts.id = active_hqe.host_id AND active_hqe.active = 1
            WHERE active_hqe.host_id IS NULL
                AND hosts.locked = 0
                AND hosts.status = 'Ready'
            ORDER BY hosts.id
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let hosts = rows
            .iter()
            .map(Self::row_to_host)
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("可用主机数: {}", hosts.len());
        Ok(hosts)
    }

    #[instrument(skip(self))]
    async fn find_by_statuses(&self, statuses: &[HostStatus]) -> SchedulerResult<Vec<Host>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE status IN ({}) ORDER BY id",
            MappingHelpers::placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(*status);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_host).collect()
    }

    #[instrument(skip(self))]
    async fn update_status(&self, id: i64, status: HostStatus) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE hosts SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::HostNotFound { id });
        }
        debug!("主机{}状态更新为{}", id, status);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_dirty(&self, id: i64, dirty: bool) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE hosts SET dirty = ?1 WHERE id = ?2")
            .bind(dirty)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::HostNotFound { id });
        }
        Ok(())
    }
}
