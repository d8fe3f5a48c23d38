use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{entities::IneligibleHostBlock, repositories::IneligibleHostRepository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteIneligibleHostRepository {
    pool: SqlitePool,
}

impl SqliteIneligibleHostRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IneligibleHostRepository for SqliteIneligibleHostRepository {
    #[instrument(skip(self))]
    async fn block(&self, job_id: i64, host_id: i64) -> SchedulerResult<()> {
        sqlx::query("INSERT INTO ineligible_host_queues (job_id, host_id) VALUES (?1, ?2)")
            .bind(job_id)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unblock(&self, job_id: i64, host_id: i64) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM ineligible_host_queues WHERE job_id = ?1 AND host_id = ?2")
            .bind(job_id)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, job_ids), fields(count = job_ids.len()))]
    async fn find_for_jobs(&self, job_ids: &[i64]) -> SchedulerResult<Vec<IneligibleHostBlock>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT job_id, host_id FROM ineligible_host_queues WHERE job_id IN ({}) ORDER BY id",
            MappingHelpers::placeholders(job_ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), job_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(IneligibleHostBlock {
                    job_id: row.try_get("job_id")?,
                    host_id: row.try_get("host_id")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_inactive(&self) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ineligible_host_queues
            WHERE job_id NOT IN
                (SELECT DISTINCT job_id FROM host_queue_entries WHERE complete = 0)
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("删除{}条失效的主机禁用记录", result.rows_affected());
        Ok(result.rows_affected())
    }
}
