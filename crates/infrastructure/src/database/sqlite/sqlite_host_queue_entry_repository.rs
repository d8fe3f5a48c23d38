use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    derive_flags, entities::HostQueueEntry, repositories::HostQueueEntryRepository,
    HostQueueEntryStatus,
};
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const ENTRY_COLUMNS: &str =
    "id, job_id, host_id, meta_host, atomic_group_id, status, aborted, execution_subdir, started_on";

pub struct SqliteHostQueueEntryRepository {
    pool: SqlitePool,
}

impl SqliteHostQueueEntryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<HostQueueEntry> {
        Ok(HostQueueEntry {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            host_id: row.try_get("host_id")?,
            meta_host: row.try_get("meta_host")?,
            atomic_group_id: row.try_get("atomic_group_id")?,
            status: row.try_get("status")?,
            aborted: row.try_get("aborted")?,
            execution_subdir: row.try_get("execution_subdir")?,
            started_on: row.try_get("started_on")?,
        })
    }

    async fn fetch_where(&self, condition: &str) -> SchedulerResult<Vec<HostQueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM host_queue_entries WHERE {condition} ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    fn ensure_updated(result: SqliteQueryResult, id: i64) -> SchedulerResult<()> {
        if result.rows_affected() == 0 {
            return Err(SchedulerError::QueueEntryNotFound { id });
        }
        Ok(())
    }
}

#[async_trait]
impl HostQueueEntryRepository for SqliteHostQueueEntryRepository {
    #[instrument(skip(self, entry), fields(job_id = entry.job_id))]
    async fn create(&self, entry: &HostQueueEntry) -> SchedulerResult<HostQueueEntry> {
        let (active, complete) = derive_flags(entry.status);
        let row = sqlx::query(
            r#"
            INSERT INTO host_queue_entries
                (job_id, host_id, meta_host, atomic_group_id, status, active, complete,
                 aborted, execution_subdir, started_on)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING id
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.host_id)
        .bind(entry.meta_host)
        .bind(entry.atomic_group_id)
        .bind(entry.status)
        .bind(active)
        .bind(complete)
        .bind(entry.aborted)
        .bind(&entry.execution_subdir)
        .bind(entry.started_on)
        .fetch_one(&self.pool)
        .await?;

        let mut created = entry.clone();
        created.id = row.try_get("id")?;
        debug!("创建队列条目成功: {}", created.id);
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<HostQueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM host_queue_entries WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<HostQueueEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM host_queue_entries WHERE id IN ({}) ORDER BY id",
            MappingHelpers::placeholders(ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    #[instrument(skip(self))]
    async fn find_by_job(&self, job_id: i64) -> SchedulerResult<Vec<HostQueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM host_queue_entries WHERE job_id = ?1 ORDER BY id");
        let rows = sqlx::query(&sql).bind(job_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    #[instrument(skip(self))]
    async fn find_by_statuses(
        &self,
        statuses: &[HostQueueEntryStatus],
    ) -> SchedulerResult<Vec<HostQueueEntry>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM host_queue_entries WHERE status IN ({}) ORDER BY id",
            MappingHelpers::placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(*status);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    #[instrument(skip(self))]
    async fn find_pending(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        self.fetch_where("active = 0 AND complete = 0 AND status = 'Queued'")
            .await
    }

    #[instrument(skip(self))]
    async fn find_active(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        self.fetch_where("active = 1").await
    }

    #[instrument(skip(self))]
    async fn find_aborting(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        self.fetch_where("aborted = 1 AND complete = 0").await
    }

    #[instrument(skip(self))]
    async fn find_inconsistent(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        self.fetch_where("active = 1 AND complete = 1").await
    }

    #[instrument(skip(self))]
    async fn update_status(&self, id: i64, status: HostQueueEntryStatus) -> SchedulerResult<()> {
        let (active, complete) = derive_flags(status);
        let result = sqlx::query(
            "UPDATE host_queue_entries SET status = ?1, active = ?2, complete = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(active)
        .bind(complete)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result, id)?;
        debug!("队列条目{}状态更新为{}", id, status);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_host(&self, id: i64, host_id: Option<i64>) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE host_queue_entries SET host_id = ?1 WHERE id = ?2")
            .bind(host_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::ensure_updated(result, id)
    }

    #[instrument(skip(self))]
    async fn update_execution_subdir(&self, id: i64, subdir: &str) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE host_queue_entries SET execution_subdir = ?1 WHERE id = ?2")
            .bind(subdir)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::ensure_updated(result, id)
    }

    #[instrument(skip(self))]
    async fn update_started_on(
        &self,
        id: i64,
        started_on: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE host_queue_entries SET started_on = ?1 WHERE id = ?2")
            .bind(started_on)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::ensure_updated(result, id)
    }

    #[instrument(skip(self))]
    async fn set_aborted(&self, id: i64) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE host_queue_entries SET aborted = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::ensure_updated(result, id)
    }
}
