//! 行映射与SQL拼接的共用工具

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::query::Query;
use sqlx::{Row, Sqlite};

pub struct MappingHelpers;

impl MappingHelpers {
    /// 生成 `?1, ?2, ...` 形式的 IN 子句占位符
    pub fn placeholders(count: usize) -> String {
        (1..=count)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn bind_ids<'q>(
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
        ids: &[i64],
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for id in ids {
            query = query.bind(*id);
        }
        query
    }

    /// 读取 (id, id) 形式的关联表结果
    pub fn id_pairs(rows: &[SqliteRow], left: &str, right: &str) -> sqlx::Result<Vec<(i64, i64)>> {
        rows.iter()
            .map(|row| Ok((row.try_get(left)?, row.try_get(right)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(MappingHelpers::placeholders(0), "");
        assert_eq!(MappingHelpers::placeholders(1), "?1");
        assert_eq!(MappingHelpers::placeholders(3), "?1, ?2, ?3");
    }
}
