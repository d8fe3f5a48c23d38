use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{entities::AclGroup, repositories::AclRepository};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::database::mapping::MappingHelpers;

pub struct SqliteAclRepository {
    pool: SqlitePool,
}

impl SqliteAclRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AclRepository for SqliteAclRepository {
    #[instrument(skip(self, job_ids), fields(count = job_ids.len()))]
    async fn find_job_acl_groups(&self, job_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        // 作业的ACL即所有者所在的ACL组
        let sql = format!(
            r#"
            SELECT jobs.id AS job_id, acl_groups_users.acl_group_id AS acl_group_id
            FROM jobs
            INNER JOIN acl_groups_users ON acl_groups_users.login = jobs.owner
            WHERE jobs.id IN ({})
            ORDER BY jobs.id, acl_groups_users.acl_group_id
            "#,
            MappingHelpers::placeholders(job_ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), job_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(MappingHelpers::id_pairs(&rows, "job_id", "acl_group_id")?)
    }

    #[instrument(skip(self, host_ids), fields(count = host_ids.len()))]
    async fn find_host_acl_groups(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        if host_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT host_id, acl_group_id FROM acl_groups_hosts WHERE host_id IN ({})",
            MappingHelpers::placeholders(host_ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), host_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(MappingHelpers::id_pairs(&rows, "host_id", "acl_group_id")?)
    }

    #[instrument(skip(self))]
    async fn find_by_name(&self, name: &str) -> SchedulerResult<Option<AclGroup>> {
        let Some(row) = sqlx::query("SELECT id, name FROM acl_groups WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;

        let users = sqlx::query("SELECT login FROM acl_groups_users WHERE acl_group_id = ?1 ORDER BY login")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.try_get("login"))
            .collect::<Result<Vec<String>, _>>()?;
        let host_ids = sqlx::query(
            "SELECT host_id FROM acl_groups_hosts WHERE acl_group_id = ?1 ORDER BY host_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| r.try_get("host_id"))
        .collect::<Result<Vec<i64>, _>>()?;

        Ok(Some(AclGroup {
            id,
            name: row.try_get("name")?,
            users,
            host_ids,
        }))
    }
}
