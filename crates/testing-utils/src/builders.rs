//! Test data builders for creating test entities
//!
//! 默认值与前端新建对象时一致：作业默认运行验证、脏时重启前清理、结束后总是清理；
//! 主机默认为Ready且不脏。

use chrono::{DateTime, TimeZone, Utc};
use scheduler_domain::{
    AclGroup, AtomicGroup, Host, HostProtection, HostQueueEntry, HostQueueEntryStatus,
    HostStatus, Job, Label, Priority, RebootAfter, RebootBefore, SpecialTask, SpecialTaskKind,
};

/// 所有构建器共用的固定时间点
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job {
                id: 1,
                owner: "my_user".to_string(),
                name: "test_job".to_string(),
                priority: Priority::Medium,
                control_file: "job.run_test('sleeptest')".to_string(),
                synch_count: 1,
                run_verify: true,
                reboot_before: RebootBefore::IfDirty,
                reboot_after: RebootAfter::Always,
                parse_failed_repair: true,
                timeout_hrs: 72,
                max_runtime_hrs: 72,
                created_on: test_epoch(),
                dependency_labels: vec![],
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.job.owner = owner.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn with_synch_count(mut self, synch_count: i32) -> Self {
        self.job.synch_count = synch_count;
        self
    }

    pub fn with_run_verify(mut self, run_verify: bool) -> Self {
        self.job.run_verify = run_verify;
        self
    }

    pub fn with_reboot_before(mut self, reboot_before: RebootBefore) -> Self {
        self.job.reboot_before = reboot_before;
        self
    }

    pub fn with_reboot_after(mut self, reboot_after: RebootAfter) -> Self {
        self.job.reboot_after = reboot_after;
        self
    }

    pub fn with_parse_failed_repair(mut self, parse_failed_repair: bool) -> Self {
        self.job.parse_failed_repair = parse_failed_repair;
        self
    }

    pub fn with_timeout_hrs(mut self, timeout_hrs: i32) -> Self {
        self.job.timeout_hrs = timeout_hrs;
        self
    }

    pub fn with_max_runtime_hrs(mut self, max_runtime_hrs: i32) -> Self {
        self.job.max_runtime_hrs = max_runtime_hrs;
        self
    }

    pub fn with_created_on(mut self, created_on: DateTime<Utc>) -> Self {
        self.job.created_on = created_on;
        self
    }

    pub fn with_dependency_labels(mut self, labels: Vec<i64>) -> Self {
        self.job.dependency_labels = labels;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test HostQueueEntry entities
pub struct QueueEntryBuilder {
    entry: HostQueueEntry,
}

impl QueueEntryBuilder {
    /// id为0，插入MockDatabase时自动分配
    pub fn new() -> Self {
        Self {
            entry: HostQueueEntry {
                id: 0,
                job_id: 1,
                host_id: None,
                meta_host: None,
                atomic_group_id: None,
                status: HostQueueEntryStatus::Queued,
                aborted: false,
                execution_subdir: String::new(),
                started_on: None,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.entry.id = id;
        self
    }

    pub fn with_job(mut self, job_id: i64) -> Self {
        self.entry.job_id = job_id;
        self
    }

    pub fn with_host(mut self, host_id: i64) -> Self {
        self.entry.host_id = Some(host_id);
        self
    }

    pub fn with_meta_host(mut self, label_id: i64) -> Self {
        self.entry.meta_host = Some(label_id);
        self
    }

    pub fn with_atomic_group(mut self, atomic_group_id: i64) -> Self {
        self.entry.atomic_group_id = Some(atomic_group_id);
        self
    }

    pub fn with_status(mut self, status: HostQueueEntryStatus) -> Self {
        self.entry.status = status;
        self
    }

    pub fn with_execution_subdir(mut self, subdir: &str) -> Self {
        self.entry.execution_subdir = subdir.to_string();
        self
    }

    pub fn with_started_on(mut self, started_on: DateTime<Utc>) -> Self {
        self.entry.started_on = Some(started_on);
        self
    }

    pub fn aborted(mut self) -> Self {
        self.entry.aborted = true;
        self
    }

    pub fn build(self) -> HostQueueEntry {
        self.entry
    }
}

impl Default for QueueEntryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Host entities
pub struct HostBuilder {
    host: Host,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            host: Host {
                id: 1,
                hostname: "host1".to_string(),
                locked: false,
                invalid: false,
                protection: HostProtection::NoProtection,
                dirty: false,
                status: HostStatus::Ready,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.host.id = id;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.host.hostname = hostname.to_string();
        self
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.host.status = status;
        self
    }

    pub fn with_protection(mut self, protection: HostProtection) -> Self {
        self.host.protection = protection;
        self
    }

    pub fn dirty(mut self) -> Self {
        self.host.dirty = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.host.locked = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.host.invalid = true;
        self
    }

    pub fn build(self) -> Host {
        self.host
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Label entities
pub struct LabelBuilder {
    label: Label,
}

impl LabelBuilder {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            label: Label {
                id,
                name: name.to_string(),
                platform: false,
                only_if_needed: false,
                invalid: false,
                atomic_group_id: None,
            },
        }
    }

    pub fn platform(mut self) -> Self {
        self.label.platform = true;
        self
    }

    pub fn only_if_needed(mut self) -> Self {
        self.label.only_if_needed = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.label.invalid = true;
        self
    }

    pub fn with_atomic_group(mut self, atomic_group_id: i64) -> Self {
        self.label.atomic_group_id = Some(atomic_group_id);
        self
    }

    pub fn build(self) -> Label {
        self.label
    }
}

pub fn atomic_group(id: i64, name: &str, max_number_of_machines: i32) -> AtomicGroup {
    AtomicGroup {
        id,
        name: name.to_string(),
        max_number_of_machines,
        invalid: false,
    }
}

pub fn acl_group(id: i64, name: &str, users: &[&str], host_ids: &[i64]) -> AclGroup {
    AclGroup {
        id,
        name: name.to_string(),
        users: users.iter().map(|u| u.to_string()).collect(),
        host_ids: host_ids.to_vec(),
    }
}

/// Builder for creating test SpecialTask entities
pub struct SpecialTaskBuilder {
    task: SpecialTask,
}

impl SpecialTaskBuilder {
    pub fn new(host_id: i64, kind: SpecialTaskKind) -> Self {
        Self {
            task: SpecialTask::new(host_id, kind, None, None, test_epoch()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_queue_entry(mut self, queue_entry_id: i64) -> Self {
        self.task.queue_entry_id = Some(queue_entry_id);
        self
    }

    pub fn requested_by(mut self, user: &str) -> Self {
        self.task.requested_by = Some(user.to_string());
        self
    }

    pub fn active(mut self) -> Self {
        self.task.is_active = true;
        self.task.time_started = Some(test_epoch());
        self
    }

    pub fn completed(mut self, success: bool) -> Self {
        self.task.is_complete = true;
        self.task.success = success;
        self
    }

    pub fn aborted(mut self) -> Self {
        self.task.aborted = true;
        self
    }

    pub fn build(self) -> SpecialTask {
        self.task
    }
}
