use std::collections::HashMap;

use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{entities::Job, repositories::JobRepository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const JOB_COLUMNS: &str = "id, owner, name, priority, control_file, synch_count, run_verify, \
     reboot_before, reboot_after, parse_failed_repair, timeout_hrs, max_runtime_hrs, created_on";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            name: row.try_get("name")?,
            priority: row.try_get("priority")?,
            control_file: row.try_get("control_file")?,
            synch_count: row.try_get("synch_count")?,
            run_verify: row.try_get("run_verify")?,
            reboot_before: row.try_get("reboot_before")?,
            reboot_after: row.try_get("reboot_after")?,
            parse_failed_repair: row.try_get("parse_failed_repair")?,
            timeout_hrs: row.try_get("timeout_hrs")?,
            max_runtime_hrs: row.try_get("max_runtime_hrs")?,
            created_on: row.try_get("created_on")?,
            dependency_labels: Vec::new(),
        })
    }

    /// 批量补齐作业的依赖标签
    async fn attach_dependencies(&self, mut jobs: Vec<Job>) -> SchedulerResult<Vec<Job>> {
        if jobs.is_empty() {
            return Ok(jobs);
        }
        let ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();
        let sql = format!(
            "SELECT job_id, label_id FROM jobs_dependency_labels WHERE job_id IN ({}) ORDER BY label_id",
            MappingHelpers::placeholders(ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), &ids)
            .fetch_all(&self.pool)
            .await?;

        let mut dependencies: HashMap<i64, Vec<i64>> = HashMap::new();
        for (job_id, label_id) in MappingHelpers::id_pairs(&rows, "job_id", "label_id")? {
            dependencies.entry(job_id).or_default().push(label_id);
        }
        for job in jobs.iter_mut() {
            job.dependency_labels = dependencies.remove(&job.id).unwrap_or_default();
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Job>> {
        let jobs = self.find_by_ids(&[id]).await?;
        Ok(jobs.into_iter().next())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id IN ({}) ORDER BY id",
            MappingHelpers::placeholders(ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), ids)
            .fetch_all(&self.pool)
            .await?;
        let jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("查询到{}个作业", jobs.len());
        self.attach_dependencies(jobs).await
    }

    #[instrument(skip(self))]
    async fn find_with_incomplete_entries(&self) -> SchedulerResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id IN \
             (SELECT DISTINCT job_id FROM host_queue_entries WHERE complete = 0) ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<SchedulerResult<Vec<_>>>()?;
        self.attach_dependencies(jobs).await
    }
}
