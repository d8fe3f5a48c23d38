//! SQLite表结构初始化
//!
//! 所有语句都是幂等的，每次启动都会执行。

use scheduler_core::SchedulerResult;
use sqlx::SqlitePool;
use tracing::debug;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS atomic_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        max_number_of_machines INTEGER NOT NULL DEFAULT 1,
        invalid BOOLEAN NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS labels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        kernel_config TEXT NOT NULL DEFAULT '',
        platform BOOLEAN NOT NULL DEFAULT 0,
        invalid BOOLEAN NOT NULL DEFAULT 0,
        only_if_needed BOOLEAN NOT NULL DEFAULT 0,
        atomic_group_id INTEGER REFERENCES atomic_groups(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL UNIQUE,
        locked BOOLEAN NOT NULL DEFAULT 0,
        invalid BOOLEAN NOT NULL DEFAULT 0,
        protection TEXT NOT NULL DEFAULT 'No protection',
        dirty BOOLEAN NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'Ready'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hosts_labels (
        host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        label_id INTEGER NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
        PRIMARY KEY (host_id, label_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acl_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acl_groups_users (
        acl_group_id INTEGER NOT NULL REFERENCES acl_groups(id) ON DELETE CASCADE,
        login TEXT NOT NULL,
        PRIMARY KEY (acl_group_id, login)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acl_groups_hosts (
        acl_group_id INTEGER NOT NULL REFERENCES acl_groups(id) ON DELETE CASCADE,
        host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        PRIMARY KEY (acl_group_id, host_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        priority TEXT NOT NULL DEFAULT 'Medium',
        control_file TEXT NOT NULL DEFAULT '',
        synch_count INTEGER NOT NULL DEFAULT 1,
        run_verify BOOLEAN NOT NULL DEFAULT 1,
        reboot_before TEXT NOT NULL DEFAULT 'If dirty',
        reboot_after TEXT NOT NULL DEFAULT 'Always',
        parse_failed_repair BOOLEAN NOT NULL DEFAULT 1,
        timeout_hrs INTEGER NOT NULL DEFAULT 72,
        max_runtime_hrs INTEGER NOT NULL DEFAULT 72,
        created_on DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs_dependency_labels (
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        label_id INTEGER NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
        PRIMARY KEY (job_id, label_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS host_queue_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        host_id INTEGER REFERENCES hosts(id),
        meta_host INTEGER REFERENCES labels(id),
        atomic_group_id INTEGER REFERENCES atomic_groups(id),
        status TEXT NOT NULL DEFAULT 'Queued',
        active BOOLEAN NOT NULL DEFAULT 0,
        complete BOOLEAN NOT NULL DEFAULT 0,
        aborted BOOLEAN NOT NULL DEFAULT 0,
        execution_subdir TEXT NOT NULL DEFAULT '',
        started_on DATETIME
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ineligible_host_queues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS special_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL REFERENCES hosts(id),
        task TEXT NOT NULL,
        queue_entry_id INTEGER REFERENCES host_queue_entries(id),
        requested_by TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 0,
        is_complete BOOLEAN NOT NULL DEFAULT 0,
        success BOOLEAN NOT NULL DEFAULT 0,
        aborted BOOLEAN NOT NULL DEFAULT 0,
        time_requested DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        time_started DATETIME
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_hqe_status ON host_queue_entries(status)",
    "CREATE INDEX IF NOT EXISTS idx_hqe_job_id ON host_queue_entries(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_hqe_host_id ON host_queue_entries(host_id)",
    "CREATE INDEX IF NOT EXISTS idx_hqe_flags ON host_queue_entries(active, complete)",
    "CREATE INDEX IF NOT EXISTS idx_hosts_status ON hosts(status)",
    "CREATE INDEX IF NOT EXISTS idx_ineligible_job_id ON ineligible_host_queues(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_special_tasks_host_id ON special_tasks(host_id)",
    "CREATE INDEX IF NOT EXISTS idx_special_tasks_state ON special_tasks(is_active, is_complete)",
];

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("Running SQLite database migrations");

    for table_sql in TABLES {
        sqlx::query(table_sql).execute(pool).await?;
    }

    for index_sql in INDEXES {
        sqlx::query(index_sql).execute(pool).await?;
    }

    debug!("Successfully completed SQLite database migrations");
    Ok(())
}
