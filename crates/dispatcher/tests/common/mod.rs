#![allow(dead_code)]

use std::sync::Arc;

use scheduler_core::{NotificationConfig, SchedulerConfig};
use scheduler_dispatcher::{Dispatcher, EmailManager, Repositories, SchedulerContext};
use scheduler_domain::{Host, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job};
use scheduler_testing_utils::{
    acl_group, FakeDroneManager, HostBuilder, JobBuilder, ManualClock, MockDatabase,
    QueueEntryBuilder, RecordingNotificationSink,
};

pub const NUM_HOSTS: i64 = 5;

/// 一次 `run_dispatcher` 执行的tick数，足够让不依赖外部进程的状态推进全部完成
pub const TICKS_PER_RUN: usize = 10;

/// 调度器集成测试环境：host1..host5 都在 Everyone ACL 中，属于 my_user
pub struct TestHarness {
    pub db: Arc<MockDatabase>,
    pub drone: FakeDroneManager,
    pub clock: ManualClock,
    pub sink: RecordingNotificationSink,
    pub dispatcher: Dispatcher,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::build(config, MockDatabase::new(), FakeDroneManager::new())
    }

    /// 使用已经准备好数据的数据库和drone，用于恢复测试
    pub fn build(config: SchedulerConfig, db: MockDatabase, drone: FakeDroneManager) -> Self {
        let db = Arc::new(db);
        let clock = ManualClock::default();
        let sink = RecordingNotificationSink::new();

        if db.host(1).is_none() {
            for id in 1..=NUM_HOSTS {
                db.insert_host(
                    HostBuilder::new()
                        .with_id(id)
                        .with_hostname(&format!("host{id}"))
                        .build(),
                );
            }
            let host_ids: Vec<i64> = (1..=NUM_HOSTS).collect();
            db.insert_acl_group(acl_group(1, "Everyone", &["my_user"], &host_ids));
        }

        let clock_arc = Arc::new(clock.clone());
        let email = EmailManager::new(
            Arc::new(sink.clone()),
            NotificationConfig::default(),
            clock_arc.clone(),
        );
        let ctx = SchedulerContext::new(
            Repositories::from_shared(db.clone()),
            Arc::new(drone.clone()),
            email,
            clock_arc,
            config,
        );
        let dispatcher = Dispatcher::new(Arc::new(ctx));

        Self {
            db,
            drone,
            clock,
            sink,
            dispatcher,
        }
    }

    pub async fn tick(&mut self) {
        self.dispatcher.tick().await.expect("tick failed");
    }

    pub async fn run_dispatcher(&mut self) {
        for _ in 0..TICKS_PER_RUN {
            self.tick().await;
        }
    }

    pub fn create_job(&self, job: Job, host_ids: &[i64]) -> Vec<HostQueueEntry> {
        let job_id = job.id;
        self.db.insert_job(job);
        host_ids
            .iter()
            .map(|host_id| {
                self.db.insert_entry(
                    QueueEntryBuilder::new()
                        .with_job(job_id)
                        .with_host(*host_id)
                        .build(),
                )
            })
            .collect()
    }

    /// 单主机作业，默认运行验证
    pub fn create_simple_job(&self, job_id: i64, host_id: i64) -> HostQueueEntry {
        let job = JobBuilder::new().with_id(job_id).build();
        self.create_job(job, &[host_id]).remove(0)
    }

    pub fn entry(&self, id: i64) -> HostQueueEntry {
        self.db.entry(id).expect("entry not found")
    }

    pub fn host(&self, id: i64) -> Host {
        self.db.host(id).expect("host not found")
    }

    pub fn assert_entry_status(&self, id: i64, status: HostQueueEntryStatus) {
        assert_eq!(self.entry(id).status, status, "entry {id}");
    }

    pub fn assert_host_status(&self, id: i64, status: HostStatus) {
        assert_eq!(self.host(id).status, status, "host {id}");
    }

    pub fn notification_sent(&self, subject: &str) -> bool {
        self.sink.subjects().iter().any(|s| s.contains(subject))
    }
}
