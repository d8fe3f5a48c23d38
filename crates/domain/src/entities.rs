use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::value_objects::{
    derive_flags, HostProtection, HostQueueEntryStatus, HostStatus, Priority, RebootAfter,
    RebootBefore, SpecialTaskKind,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub priority: Priority,
    pub control_file: String,
    /// 开始运行所需的最少主机数
    pub synch_count: i32,
    pub run_verify: bool,
    pub reboot_before: RebootBefore,
    pub reboot_after: RebootAfter,
    pub parse_failed_repair: bool,
    pub timeout_hrs: i32,
    pub max_runtime_hrs: i32,
    pub created_on: DateTime<Utc>,
    /// 依赖的标签 ID
    pub dependency_labels: Vec<i64>,
}

impl Job {
    /// 结果目录顶层名称，例如 `12-alice`
    pub fn tag(&self) -> String {
        format!("{}-{}", self.id, self.owner)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostQueueEntry {
    pub id: i64,
    pub job_id: i64,
    pub host_id: Option<i64>,
    /// 元主机标签：调度到任意带有该标签的主机
    pub meta_host: Option<i64>,
    pub atomic_group_id: Option<i64>,
    pub status: HostQueueEntryStatus,
    pub aborted: bool,
    pub execution_subdir: String,
    pub started_on: Option<DateTime<Utc>>,
}

impl HostQueueEntry {
    pub fn active(&self) -> bool {
        derive_flags(self.status).0
    }

    pub fn complete(&self) -> bool {
        derive_flags(self.status).1
    }

    pub fn is_metahost(&self) -> bool {
        self.meta_host.is_some()
    }

    /// 没有任何放置目标的条目（例如只在服务端运行的作业）
    pub fn is_hostless(&self) -> bool {
        self.host_id.is_none() && self.meta_host.is_none() && self.atomic_group_id.is_none()
    }

    /// 相对于结果仓库的执行标签：`<job_id>-<owner>/<execution_subdir>`
    pub fn execution_tag(&self, job: &Job) -> String {
        format!("{}/{}", job.tag(), self.execution_subdir)
    }

    pub fn entry_description(&self) -> String {
        let target = match (self.host_id, self.meta_host, self.atomic_group_id) {
            (Some(host_id), _, _) => format!("host {host_id}"),
            (None, Some(label_id), _) => format!("meta_host {label_id}"),
            (None, None, Some(group_id)) => format!("atomic_group {group_id}"),
            (None, None, None) => "hostless".to_string(),
        };
        format!("HQE {} (job {}, {target}, {})", self.id, self.job_id, self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub hostname: String,
    pub locked: bool,
    /// 一次性主机，被删除后仍可被直接指定的条目使用
    pub invalid: bool,
    pub protection: HostProtection,
    pub dirty: bool,
    pub status: HostStatus,
}

impl Host {
    /// 按主机名排序：尾部数字按数值比较，例如 host2 < host09 < host10
    pub fn cmp_for_sort(a: &Host, b: &Host) -> Ordering {
        compare_hostnames(&a.hostname, &b.hostname)
    }
}

/// 排序键：去掉尾部数字后的名称、尾部数字的数值、完整的小写主机名
fn hostname_sort_key(hostname: &str) -> (String, u64, String) {
    let lower = hostname.to_lowercase();
    let name = lower.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &lower[name.len()..];
    let number = if digits.is_empty() {
        0
    } else {
        digits.parse::<u64>().unwrap_or(u64::MAX)
    };
    (name.to_string(), number, lower.clone())
}

pub fn compare_hostnames(a: &str, b: &str) -> Ordering {
    hostname_sort_key(a).cmp(&hostname_sort_key(b))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub platform: bool,
    /// 只有作业显式依赖时才可以使用带此标签的主机
    pub only_if_needed: bool,
    pub invalid: bool,
    pub atomic_group_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicGroup {
    pub id: i64,
    pub name: String,
    pub max_number_of_machines: i32,
    pub invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclGroup {
    pub id: i64,
    pub name: String,
    pub users: Vec<String>,
    pub host_ids: Vec<i64>,
}

impl AclGroup {
    pub const EVERYONE: &'static str = "Everyone";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialTask {
    pub id: i64,
    pub host_id: i64,
    pub task: SpecialTaskKind,
    pub queue_entry_id: Option<i64>,
    pub requested_by: Option<String>,
    pub is_active: bool,
    pub is_complete: bool,
    pub success: bool,
    /// 由外部工具设置，下一次tick时中止
    pub aborted: bool,
    pub time_requested: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
}

impl SpecialTask {
    /// 新建一个排队中的特殊任务，id 由仓储分配
    pub fn new(
        host_id: i64,
        task: SpecialTaskKind,
        queue_entry_id: Option<i64>,
        requested_by: Option<String>,
        time_requested: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            host_id,
            task,
            queue_entry_id,
            requested_by,
            is_active: false,
            is_complete: false,
            success: false,
            aborted: false,
            time_requested,
            time_started: None,
        }
    }

    /// 结果目录：`hosts/<hostname>/<id>-<task>`
    pub fn execution_path(&self, hostname: &str) -> String {
        format!("hosts/{}/{}-{}", hostname, self.id, self.task.dir_suffix())
    }

    pub fn is_queued(&self) -> bool {
        !self.is_active && !self.is_complete
    }
}

/// 禁止同一作业的多个条目调度到同一台主机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IneligibleHostBlock {
    pub job_id: i64,
    pub host_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_natural_order() {
        let mut names = vec![
            "yolkfolk", "host10", "host2", "alice", "host010", "host09", "host1", "host11",
        ];
        names.sort_by(|a, b| compare_hostnames(a, b));
        assert_eq!(
            names,
            vec!["alice", "host1", "host2", "host09", "host010", "host10", "host11", "yolkfolk"]
        );
    }

    #[test]
    fn test_hostname_order_ignores_case() {
        assert_eq!(compare_hostnames("Host3", "host12"), Ordering::Less);
        assert_eq!(compare_hostnames("rack-a7", "rack-a07"), Ordering::Greater);
    }

    #[test]
    fn test_special_task_execution_path() {
        let mut task = SpecialTask::new(1, SpecialTaskKind::Verify, None, None, Utc::now());
        task.id = 7;
        assert_eq!(task.execution_path("host1"), "hosts/host1/7-verify");
        assert!(task.is_queued());
    }

    #[test]
    fn test_entry_flags_follow_status() {
        let mut entry = HostQueueEntry {
            id: 1,
            job_id: 1,
            host_id: Some(1),
            meta_host: None,
            atomic_group_id: None,
            status: HostQueueEntryStatus::Queued,
            aborted: false,
            execution_subdir: String::new(),
            started_on: None,
        };
        assert!(!entry.active() && !entry.complete());
        entry.status = HostQueueEntryStatus::Running;
        assert!(entry.active() && !entry.complete());
        entry.status = HostQueueEntryStatus::Failed;
        assert!(!entry.active() && entry.complete());
    }
}
