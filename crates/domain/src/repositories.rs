//! 领域仓储抽象
//!
//! 定义调度核心消费的数据访问接口。状态类字段只提供按字段更新的方法，
//! 避免用过期的整行数据覆盖外部写入（例如Web界面设置的 `aborted`）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;

use crate::entities::{
    AclGroup, AtomicGroup, Host, HostQueueEntry, IneligibleHostBlock, Job, Label, SpecialTask,
};
use crate::value_objects::{HostQueueEntryStatus, HostStatus};

/// 作业仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Job>>;
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Job>>;
    /// 仍有未完成条目的作业
    async fn find_with_incomplete_entries(&self) -> SchedulerResult<Vec<Job>>;
}

/// 队列条目仓储抽象
#[async_trait]
pub trait HostQueueEntryRepository: Send + Sync {
    async fn create(&self, entry: &HostQueueEntry) -> SchedulerResult<HostQueueEntry>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<HostQueueEntry>>;
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<HostQueueEntry>>;
    async fn find_by_job(&self, job_id: i64) -> SchedulerResult<Vec<HostQueueEntry>>;
    async fn find_by_statuses(
        &self,
        statuses: &[HostQueueEntryStatus],
    ) -> SchedulerResult<Vec<HostQueueEntry>>;
    /// 状态为Queued且既不活跃也未完成的条目
    async fn find_pending(&self) -> SchedulerResult<Vec<HostQueueEntry>>;
    async fn find_active(&self) -> SchedulerResult<Vec<HostQueueEntry>>;
    /// 被标记为中止但尚未完成的条目
    async fn find_aborting(&self) -> SchedulerResult<Vec<HostQueueEntry>>;
    /// active 与 complete 同时为真的条目，只可能来自外部写入
    async fn find_inconsistent(&self) -> SchedulerResult<Vec<HostQueueEntry>>;
    /// 写入状态以及由状态推导出的 active/complete
    async fn update_status(&self, id: i64, status: HostQueueEntryStatus) -> SchedulerResult<()>;
    async fn update_host(&self, id: i64, host_id: Option<i64>) -> SchedulerResult<()>;
    async fn update_execution_subdir(&self, id: i64, subdir: &str) -> SchedulerResult<()>;
    async fn update_started_on(
        &self,
        id: i64,
        started_on: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()>;
    async fn set_aborted(&self, id: i64) -> SchedulerResult<()>;
}

/// 主机仓储抽象
#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Host>>;
    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Host>>;
    /// 未锁定、状态为Ready且没有活跃条目的主机（包含一次性主机）
    async fn find_ready(&self) -> SchedulerResult<Vec<Host>>;
    async fn find_by_statuses(&self, statuses: &[HostStatus]) -> SchedulerResult<Vec<Host>>;
    async fn update_status(&self, id: i64, status: HostStatus) -> SchedulerResult<()>;
    async fn update_dirty(&self, id: i64, dirty: bool) -> SchedulerResult<()>;
}

/// 标签与原子组仓储抽象
#[async_trait]
pub trait LabelRepository: Send + Sync {
    async fn find_all(&self) -> SchedulerResult<Vec<Label>>;
    /// 返回 (host_id, label_id)
    async fn find_host_labels(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>>;
    async fn find_labels_for_host(&self, host_id: i64) -> SchedulerResult<Vec<Label>>;
    async fn find_atomic_groups(&self) -> SchedulerResult<Vec<AtomicGroup>>;
    async fn find_atomic_group(&self, id: i64) -> SchedulerResult<Option<AtomicGroup>>;
}

/// ACL仓储抽象
#[async_trait]
pub trait AclRepository: Send + Sync {
    /// 作业所有者所属的ACL组，返回 (job_id, acl_group_id)
    async fn find_job_acl_groups(&self, job_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>>;
    /// 返回 (host_id, acl_group_id)
    async fn find_host_acl_groups(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>>;
    async fn find_by_name(&self, name: &str) -> SchedulerResult<Option<AclGroup>>;
}

/// 主机禁用队列仓储抽象
#[async_trait]
pub trait IneligibleHostRepository: Send + Sync {
    async fn block(&self, job_id: i64, host_id: i64) -> SchedulerResult<()>;
    async fn unblock(&self, job_id: i64, host_id: i64) -> SchedulerResult<()>;
    async fn find_for_jobs(&self, job_ids: &[i64]) -> SchedulerResult<Vec<IneligibleHostBlock>>;
    /// 删除所属作业已没有未完成条目的记录，返回删除数量
    async fn delete_inactive(&self) -> SchedulerResult<u64>;
}

/// 特殊任务仓储抽象
#[async_trait]
pub trait SpecialTaskRepository: Send + Sync {
    async fn create(&self, task: &SpecialTask) -> SchedulerResult<SpecialTask>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<SpecialTask>>;
    /// 尚未激活也未完成的任务，按id排序
    async fn find_queued(&self) -> SchedulerResult<Vec<SpecialTask>>;
    async fn find_active(&self) -> SchedulerResult<Vec<SpecialTask>>;
    async fn find_by_queue_entry(&self, queue_entry_id: i64) -> SchedulerResult<Vec<SpecialTask>>;
    async fn find_aborting(&self) -> SchedulerResult<Vec<SpecialTask>>;
    async fn activate(&self, id: i64, time_started: DateTime<Utc>) -> SchedulerResult<()>;
    /// 标记为完成（任务不会被删除）
    async fn finish(&self, id: i64, success: bool) -> SchedulerResult<()>;
}
