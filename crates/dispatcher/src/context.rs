use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use scheduler_core::{Clock, SchedulerConfig, SchedulerError, SchedulerResult};
use scheduler_domain::{
    AclRepository, Host, HostQueueEntry, HostQueueEntryRepository, HostRepository,
    IneligibleHostRepository, Job, JobRepository, LabelRepository, SpecialTaskRepository,
};
use scheduler_drone::DroneManager;

use crate::notifications::EmailManager;

/// 调度核心使用的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub entries: Arc<dyn HostQueueEntryRepository>,
    pub hosts: Arc<dyn HostRepository>,
    pub labels: Arc<dyn LabelRepository>,
    pub acls: Arc<dyn AclRepository>,
    pub ineligible_hosts: Arc<dyn IneligibleHostRepository>,
    pub special_tasks: Arc<dyn SpecialTaskRepository>,
}

impl Repositories {
    /// 用同一个对象实现所有仓储（内存实现或测试替身）
    pub fn from_shared<T>(repo: Arc<T>) -> Self
    where
        T: JobRepository
            + HostQueueEntryRepository
            + HostRepository
            + LabelRepository
            + AclRepository
            + IneligibleHostRepository
            + SpecialTaskRepository
            + 'static,
    {
        Self {
            jobs: repo.clone(),
            entries: repo.clone(),
            hosts: repo.clone(),
            labels: repo.clone(),
            acls: repo.clone(),
            ineligible_hosts: repo.clone(),
            special_tasks: repo,
        }
    }
}

/// 原子组作业等待更多主机时的延迟句柄，每个作业至多一个
#[derive(Debug)]
pub struct DelayHandle {
    pub end_time: DateTime<Utc>,
    aborted: AtomicBool,
}

impl DelayHandle {
    pub fn new(end_time: DateTime<Utc>) -> Self {
        Self {
            end_time,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// 所有任务和生命周期操作共享的依赖
pub struct SchedulerContext {
    pub repos: Repositories,
    pub drone_manager: Arc<dyn DroneManager>,
    pub email: EmailManager,
    pub clock: Arc<dyn Clock>,
    pub config: SchedulerConfig,
    delays: Mutex<HashMap<i64, Arc<DelayHandle>>>,
    parse_processes: AtomicUsize,
    archive_processes: AtomicUsize,
}

impl SchedulerContext {
    pub fn new(
        repos: Repositories,
        drone_manager: Arc<dyn DroneManager>,
        email: EmailManager,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repos,
            drone_manager,
            email,
            clock,
            config,
            delays: Mutex::new(HashMap::new()),
            parse_processes: AtomicUsize::new(0),
            archive_processes: AtomicUsize::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn job(&self, id: i64) -> SchedulerResult<Job> {
        self.repos
            .jobs
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id })
    }

    pub async fn entry(&self, id: i64) -> SchedulerResult<HostQueueEntry> {
        self.repos
            .entries
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::QueueEntryNotFound { id })
    }

    pub async fn host(&self, id: i64) -> SchedulerResult<Host> {
        self.repos
            .hosts
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::HostNotFound { id })
    }

    /// 条目已分配的主机，没有主机时视为状态错误
    pub async fn host_of(&self, entry: &HostQueueEntry) -> SchedulerResult<Host> {
        match entry.host_id {
            Some(host_id) => self.host(host_id).await,
            None => Err(SchedulerError::invalid_state(format!(
                "{} 没有分配主机",
                entry.entry_description()
            ))),
        }
    }

    pub fn delay_handle(&self, job_id: i64) -> Option<Arc<DelayHandle>> {
        self.lock_delays().get(&job_id).cloned()
    }

    /// 已存在句柄时返回 None
    pub fn create_delay_handle(
        &self,
        job_id: i64,
        end_time: DateTime<Utc>,
    ) -> Option<Arc<DelayHandle>> {
        let mut delays = self.lock_delays();
        if delays.contains_key(&job_id) {
            return None;
        }
        let handle = Arc::new(DelayHandle::new(end_time));
        delays.insert(job_id, handle.clone());
        Some(handle)
    }

    pub fn remove_delay_handle(&self, job_id: i64) -> Option<Arc<DelayHandle>> {
        self.lock_delays().remove(&job_id)
    }

    fn lock_delays(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<DelayHandle>>> {
        // 持锁期间不会panic，中毒时继续使用内部数据
        self.delays.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn throttle(&self, kind: ThrottleKind) -> &AtomicUsize {
        match kind {
            ThrottleKind::Parse => &self.parse_processes,
            ThrottleKind::Archive => &self.archive_processes,
        }
    }

    pub(crate) fn throttle_limit(&self, kind: ThrottleKind) -> usize {
        match kind {
            ThrottleKind::Parse => self.config.max_parse_processes,
            ThrottleKind::Archive => self.config.max_transfer_processes,
        }
    }

    /// 当前运行中的解析/归档进程数
    pub fn throttled_processes(&self, kind: ThrottleKind) -> usize {
        self.throttle(kind).load(Ordering::SeqCst)
    }
}

/// 自行限流的后处理进程类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleKind {
    Parse,
    Archive,
}
