use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::SpecialTask, repositories::SpecialTaskRepository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const TASK_COLUMNS: &str = "id, host_id, task, queue_entry_id, requested_by, is_active, \
     is_complete, success, aborted, time_requested, time_started";

pub struct SqliteSpecialTaskRepository {
    pool: SqlitePool,
}

impl SqliteSpecialTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<SpecialTask> {
        Ok(SpecialTask {
            id: row.try_get("id")?,
            host_id: row.try_get("host_id")?,
            task: row.try_get("task")?,
            queue_entry_id: row.try_get("queue_entry_id")?,
            requested_by: row.try_get("requested_by")?,
            is_active: row.try_get("is_active")?,
            is_complete: row.try_get("is_complete")?,
            success: row.try_get("success")?,
            aborted: row.try_get("aborted")?,
            time_requested: row.try_get("time_requested")?,
            time_started: row.try_get("time_started")?,
        })
    }

    async fn fetch_where(&self, condition: &str) -> SchedulerResult<Vec<SpecialTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM special_tasks WHERE {condition} ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

#[async_trait]
impl SpecialTaskRepository for SqliteSpecialTaskRepository {
    #[instrument(skip(self, task), fields(host_id = task.host_id, kind = %task.task))]
    async fn create(&self, task: &SpecialTask) -> SchedulerResult<SpecialTask> {
        let row = sqlx::query(
            r#"
            INSERT INTO special_tasks
                (host_id, task, queue_entry_id, requested_by, is_active, is_complete,
                 success, aborted, time_requested, time_started)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING id
            "#,
        )
        .bind(task.host_id)
        .bind(task.task)
        .bind(task.queue_entry_id)
        .bind(&task.requested_by)
        .bind(task.is_active)
        .bind(task.is_complete)
        .bind(task.success)
        .bind(task.aborted)
        .bind(task.time_requested)
        .bind(task.time_started)
        .fetch_one(&self.pool)
        .await?;

        let mut created = task.clone();
        created.id = row.try_get("id")?;
        debug!("创建特殊任务成功: {} {}", created.task, created.id);
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<SpecialTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM special_tasks WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn find_queued(&self) -> SchedulerResult<Vec<SpecialTask>> {
        self.fetch_where("is_active = 0 AND is_complete = 0").await
    }

    #[instrument(skip(self))]
    async fn find_active(&self) -> SchedulerResult<Vec<SpecialTask>> {
        self.fetch_where("is_active = 1 AND is_complete = 0").await
    }

    #[instrument(skip(self))]
    async fn find_by_queue_entry(&self, queue_entry_id: i64) -> SchedulerResult<Vec<SpecialTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM special_tasks WHERE queue_entry_id = ?1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(queue_entry_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn find_aborting(&self) -> SchedulerResult<Vec<SpecialTask>> {
        self.fetch_where("aborted = 1 AND is_complete = 0").await
    }

    #[instrument(skip(self))]
    async fn activate(&self, id: i64, time_started: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE special_tasks SET is_active = 1, time_started = ?1 WHERE id = ?2",
        )
        .bind(time_started)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::SpecialTaskNotFound { id });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finish(&self, id: i64, success: bool) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE special_tasks SET is_active = 0, is_complete = 1, success = ?1 WHERE id = ?2",
        )
        .bind(success)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::SpecialTaskNotFound { id });
        }
        debug!("特殊任务{}完成, success={}", id, success);
        Ok(())
    }
}
