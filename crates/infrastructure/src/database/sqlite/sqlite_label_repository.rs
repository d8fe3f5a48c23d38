use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    entities::{AtomicGroup, Label},
    repositories::LabelRepository,
};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::database::mapping::MappingHelpers;

pub struct SqliteLabelRepository {
    pool: SqlitePool,
}

impl SqliteLabelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_label(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Label> {
        Ok(Label {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            platform: row.try_get("platform")?,
            only_if_needed: row.try_get("only_if_needed")?,
            invalid: row.try_get("invalid")?,
            atomic_group_id: row.try_get("atomic_group_id")?,
        })
    }

    fn row_to_atomic_group(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<AtomicGroup> {
        Ok(AtomicGroup {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            max_number_of_machines: row.try_get("max_number_of_machines")?,
            invalid: row.try_get("invalid")?,
        })
    }
}

#[async_trait]
impl LabelRepository for SqliteLabelRepository {
    #[instrument(skip(self))]
    async fn find_all(&self) -> SchedulerResult<Vec<Label>> {
        let rows = sqlx::query(
            "SELECT id, name, platform, only_if_needed, invalid, atomic_group_id FROM labels ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_label).collect()
    }

    #[instrument(skip(self, host_ids), fields(count = host_ids.len()))]
    async fn find_host_labels(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        if host_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT host_id, label_id FROM hosts_labels WHERE host_id IN ({})",
            MappingHelpers::placeholders(host_ids.len())
        );
        let rows = MappingHelpers::bind_ids(sqlx::query(&sql), host_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(MappingHelpers::id_pairs(&rows, "host_id", "label_id")?)
    }

    #[instrument(skip(self))]
    async fn find_labels_for_host(&self, host_id: i64) -> SchedulerResult<Vec<Label>> {
        let rows = sqlx::query(
            r#"
            SELECT labels.id, labels.name, labels.platform, labels.only_if_needed,
                   labels.invalid, labels.atomic_group_id
            FROM labels
            INNER JOIN hosts_labels ON hosts_labels.label_id = labels.id
            WHERE hosts_labels.host_id = ?1
            ORDER BY labels.name
            "#,
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_label).collect()
    }

    #[instrument(skip(self))]
    async fn find_atomic_groups(&self) -> SchedulerResult<Vec<AtomicGroup>> {
        let rows = sqlx::query(
            "SELECT id, name, max_number_of_machines, invalid FROM atomic_groups ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_atomic_group).collect()
    }

    #[instrument(skip(self))]
    async fn find_atomic_group(&self, id: i64) -> SchedulerResult<Option<AtomicGroup>> {
        let row = sqlx::query(
            "SELECT id, name, max_number_of_machines, invalid FROM atomic_groups WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_atomic_group).transpose()
    }
}
