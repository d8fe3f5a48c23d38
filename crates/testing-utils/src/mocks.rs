//! Mock implementations for the repository, drone and notification traits
//!
//! 所有mock都是内存实现，可以在不依赖数据库和真实进程的情况下驱动调度器。
//! 状态放在 `Arc<Mutex<..>>` 中，克隆出来的句柄共享同一份数据，测试代码
//! 可以一边把句柄交给调度器，一边直接修改或断言其中的数据。

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use scheduler_core::{Clock, SchedulerError, SchedulerResult};
use scheduler_domain::{
    AclGroup, AclRepository, AtomicGroup, Host, HostQueueEntry, HostQueueEntryRepository,
    HostQueueEntryStatus, HostRepository, HostStatus, IneligibleHostBlock,
    IneligibleHostRepository, Job, JobRepository, Label, LabelRepository, Notification,
    NotificationSink, SpecialTask, SpecialTaskRepository,
};
use scheduler_drone::{
    DroneManager, PidfileContents, PidfileId, Process, RunRequest, ARCHIVER_PID_FILE,
    AUTOSERV_PID_FILE, CRASHINFO_PID_FILE, PARSER_PID_FILE,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct DbState {
    jobs: BTreeMap<i64, Job>,
    entries: BTreeMap<i64, HostQueueEntry>,
    hosts: BTreeMap<i64, Host>,
    labels: BTreeMap<i64, Label>,
    atomic_groups: BTreeMap<i64, AtomicGroup>,
    host_labels: Vec<(i64, i64)>,
    acl_groups: BTreeMap<i64, AclGroup>,
    ineligible: Vec<IneligibleHostBlock>,
    special_tasks: BTreeMap<i64, SpecialTask>,
    /// 模拟外部写入造成的 active=complete=1 条目
    inconsistent: HashSet<i64>,
    next_entry_id: i64,
    next_special_task_id: i64,
}

/// Mock implementation of every repository trait, backed by one shared in-memory state
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.insert(job.id, job);
    }

    pub fn insert_host(&self, host: Host) {
        self.state.lock().unwrap().hosts.insert(host.id, host);
    }

    pub fn insert_label(&self, label: Label) {
        self.state.lock().unwrap().labels.insert(label.id, label);
    }

    pub fn insert_atomic_group(&self, group: AtomicGroup) {
        self.state
            .lock()
            .unwrap()
            .atomic_groups
            .insert(group.id, group);
    }

    pub fn insert_acl_group(&self, group: AclGroup) {
        self.state.lock().unwrap().acl_groups.insert(group.id, group);
    }

    pub fn add_host_label(&self, host_id: i64, label_id: i64) {
        self.state
            .lock()
            .unwrap()
            .host_labels
            .push((host_id, label_id));
    }

    /// 插入条目；id为0时自动分配
    pub fn insert_entry(&self, mut entry: HostQueueEntry) -> HostQueueEntry {
        let mut state = self.state.lock().unwrap();
        if entry.id == 0 {
            state.next_entry_id = state.next_entry_id.max(state.max_entry_id()) + 1;
            entry.id = state.next_entry_id;
        }
        state.entries.insert(entry.id, entry.clone());
        entry
    }

    /// 插入特殊任务；id为0时自动分配
    pub fn insert_special_task(&self, mut task: SpecialTask) -> SpecialTask {
        let mut state = self.state.lock().unwrap();
        if task.id == 0 {
            state.next_special_task_id =
                state.next_special_task_id.max(state.max_special_task_id()) + 1;
            task.id = state.next_special_task_id;
        }
        state.special_tasks.insert(task.id, task.clone());
        task
    }

    pub fn mark_inconsistent(&self, entry_id: i64) {
        self.state.lock().unwrap().inconsistent.insert(entry_id);
    }

    pub fn job(&self, id: i64) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&id).cloned()
    }

    pub fn entry(&self, id: i64) -> Option<HostQueueEntry> {
        self.state.lock().unwrap().entries.get(&id).cloned()
    }

    pub fn host(&self, id: i64) -> Option<Host> {
        self.state.lock().unwrap().hosts.get(&id).cloned()
    }

    pub fn entries_for_job(&self, job_id: i64) -> Vec<HostQueueEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn special_tasks(&self) -> Vec<SpecialTask> {
        self.state
            .lock()
            .unwrap()
            .special_tasks
            .values()
            .cloned()
            .collect()
    }

    pub fn ineligible_blocks(&self) -> Vec<IneligibleHostBlock> {
        self.state.lock().unwrap().ineligible.clone()
    }

    pub fn update_job(&self, id: i64, update: impl FnOnce(&mut Job)) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&id) {
            update(job);
        }
    }

    pub fn update_entry(&self, id: i64, update: impl FnOnce(&mut HostQueueEntry)) {
        if let Some(entry) = self.state.lock().unwrap().entries.get_mut(&id) {
            update(entry);
        }
    }

    pub fn update_host(&self, id: i64, update: impl FnOnce(&mut Host)) {
        if let Some(host) = self.state.lock().unwrap().hosts.get_mut(&id) {
            update(host);
        }
    }

    /// 模拟Web界面中止整个作业
    pub fn abort_job(&self, job_id: i64) {
        for entry in self.state.lock().unwrap().entries.values_mut() {
            if entry.job_id == job_id {
                entry.aborted = true;
            }
        }
    }
}

impl DbState {
    fn max_entry_id(&self) -> i64 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    fn max_special_task_id(&self) -> i64 {
        self.special_tasks.keys().next_back().copied().unwrap_or(0)
    }

    fn entries_where(&self, filter: impl Fn(&HostQueueEntry) -> bool) -> Vec<HostQueueEntry> {
        self.entries.values().filter(|e| filter(e)).cloned().collect()
    }

    fn entry_mut(&mut self, id: i64) -> SchedulerResult<&mut HostQueueEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(SchedulerError::QueueEntryNotFound { id })
    }

    fn host_mut(&mut self, id: i64) -> SchedulerResult<&mut Host> {
        self.hosts
            .get_mut(&id)
            .ok_or(SchedulerError::HostNotFound { id })
    }

    fn special_task_mut(&mut self, id: i64) -> SchedulerResult<&mut SpecialTask> {
        self.special_tasks
            .get_mut(&id)
            .ok_or(SchedulerError::SpecialTaskNotFound { id })
    }
}

#[async_trait]
impl JobRepository for MockDatabase {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|j| ids.contains(&j.id))
            .cloned()
            .collect())
    }

    async fn find_with_incomplete_entries(&self) -> SchedulerResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                state
                    .entries
                    .values()
                    .any(|e| e.job_id == j.id && !e.complete())
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HostQueueEntryRepository for MockDatabase {
    async fn create(&self, entry: &HostQueueEntry) -> SchedulerResult<HostQueueEntry> {
        let mut new_entry = entry.clone();
        new_entry.id = 0;
        Ok(self.insert_entry(new_entry))
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<HostQueueEntry>> {
        Ok(self.entry(id))
    }

    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| ids.contains(&e.id)))
    }

    async fn find_by_job(&self, job_id: i64) -> SchedulerResult<Vec<HostQueueEntry>> {
        Ok(self.entries_for_job(job_id))
    }

    async fn find_by_statuses(
        &self,
        statuses: &[HostQueueEntryStatus],
    ) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| statuses.contains(&e.status)))
    }

    async fn find_pending(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| {
            e.status == HostQueueEntryStatus::Queued && !e.active() && !e.complete()
        }))
    }

    async fn find_active(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| e.active()))
    }

    async fn find_aborting(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| e.aborted && !e.complete()))
    }

    async fn find_inconsistent(&self) -> SchedulerResult<Vec<HostQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries_where(|e| state.inconsistent.contains(&e.id)))
    }

    async fn update_status(&self, id: i64, status: HostQueueEntryStatus) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.entry_mut(id)?.status = status;
        state.inconsistent.remove(&id);
        Ok(())
    }

    async fn update_host(&self, id: i64, host_id: Option<i64>) -> SchedulerResult<()> {
        self.state.lock().unwrap().entry_mut(id)?.host_id = host_id;
        Ok(())
    }

    async fn update_execution_subdir(&self, id: i64, subdir: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().entry_mut(id)?.execution_subdir = subdir.to_string();
        Ok(())
    }

    async fn update_started_on(
        &self,
        id: i64,
        started_on: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        self.state.lock().unwrap().entry_mut(id)?.started_on = started_on;
        Ok(())
    }

    async fn set_aborted(&self, id: i64) -> SchedulerResult<()> {
        self.state.lock().unwrap().entry_mut(id)?.aborted = true;
        Ok(())
    }
}

#[async_trait]
impl HostRepository for MockDatabase {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Host>> {
        Ok(self.host(id))
    }

    async fn find_by_ids(&self, ids: &[i64]) -> SchedulerResult<Vec<Host>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hosts
            .values()
            .filter(|h| ids.contains(&h.id))
            .cloned()
            .collect())
    }

    async fn find_ready(&self) -> SchedulerResult<Vec<Host>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hosts
            .values()
            .filter(|h| !h.locked && h.status == HostStatus::Ready)
            .filter(|h| {
                !state
                    .entries
                    .values()
                    .any(|e| e.host_id == Some(h.id) && e.active())
            })
            .cloned()
            .collect())
    }

    async fn find_by_statuses(&self, statuses: &[HostStatus]) -> SchedulerResult<Vec<Host>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hosts
            .values()
            .filter(|h| statuses.contains(&h.status))
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: i64, status: HostStatus) -> SchedulerResult<()> {
        self.state.lock().unwrap().host_mut(id)?.status = status;
        Ok(())
    }

    async fn update_dirty(&self, id: i64, dirty: bool) -> SchedulerResult<()> {
        self.state.lock().unwrap().host_mut(id)?.dirty = dirty;
        Ok(())
    }
}

#[async_trait]
impl LabelRepository for MockDatabase {
    async fn find_all(&self) -> SchedulerResult<Vec<Label>> {
        Ok(self.state.lock().unwrap().labels.values().cloned().collect())
    }

    async fn find_host_labels(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .host_labels
            .iter()
            .filter(|(host_id, _)| host_ids.contains(host_id))
            .copied()
            .collect())
    }

    async fn find_labels_for_host(&self, host_id: i64) -> SchedulerResult<Vec<Label>> {
        let state = self.state.lock().unwrap();
        let mut labels: Vec<Label> = state
            .host_labels
            .iter()
            .filter(|(h, _)| *h == host_id)
            .filter_map(|(_, label_id)| state.labels.get(label_id).cloned())
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(labels)
    }

    async fn find_atomic_groups(&self) -> SchedulerResult<Vec<AtomicGroup>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .atomic_groups
            .values()
            .cloned()
            .collect())
    }

    async fn find_atomic_group(&self, id: i64) -> SchedulerResult<Option<AtomicGroup>> {
        Ok(self.state.lock().unwrap().atomic_groups.get(&id).cloned())
    }
}

#[async_trait]
impl AclRepository for MockDatabase {
    async fn find_job_acl_groups(&self, job_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        let state = self.state.lock().unwrap();
        let mut pairs = Vec::new();
        for job in state.jobs.values().filter(|j| job_ids.contains(&j.id)) {
            for group in state.acl_groups.values() {
                if group.users.contains(&job.owner) {
                    pairs.push((job.id, group.id));
                }
            }
        }
        Ok(pairs)
    }

    async fn find_host_acl_groups(&self, host_ids: &[i64]) -> SchedulerResult<Vec<(i64, i64)>> {
        let state = self.state.lock().unwrap();
        let mut pairs = Vec::new();
        for group in state.acl_groups.values() {
            for host_id in group.host_ids.iter().filter(|h| host_ids.contains(h)) {
                pairs.push((*host_id, group.id));
            }
        }
        Ok(pairs)
    }

    async fn find_by_name(&self, name: &str) -> SchedulerResult<Option<AclGroup>> {
        let state = self.state.lock().unwrap();
        Ok(state.acl_groups.values().find(|g| g.name == name).cloned())
    }
}

#[async_trait]
impl IneligibleHostRepository for MockDatabase {
    async fn block(&self, job_id: i64, host_id: i64) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .ineligible
            .push(IneligibleHostBlock { job_id, host_id });
        Ok(())
    }

    async fn unblock(&self, job_id: i64, host_id: i64) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .ineligible
            .retain(|b| !(b.job_id == job_id && b.host_id == host_id));
        Ok(())
    }

    async fn find_for_jobs(&self, job_ids: &[i64]) -> SchedulerResult<Vec<IneligibleHostBlock>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ineligible
            .iter()
            .filter(|b| job_ids.contains(&b.job_id))
            .copied()
            .collect())
    }

    async fn delete_inactive(&self) -> SchedulerResult<u64> {
        let mut state = self.state.lock().unwrap();
        let live_jobs: HashSet<i64> = state
            .entries
            .values()
            .filter(|e| !e.complete())
            .map(|e| e.job_id)
            .collect();
        let before = state.ineligible.len();
        state.ineligible.retain(|b| live_jobs.contains(&b.job_id));
        Ok((before - state.ineligible.len()) as u64)
    }
}

#[async_trait]
impl SpecialTaskRepository for MockDatabase {
    async fn create(&self, task: &SpecialTask) -> SchedulerResult<SpecialTask> {
        let mut new_task = task.clone();
        new_task.id = 0;
        Ok(self.insert_special_task(new_task))
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<SpecialTask>> {
        Ok(self.state.lock().unwrap().special_tasks.get(&id).cloned())
    }

    async fn find_queued(&self) -> SchedulerResult<Vec<SpecialTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .special_tasks
            .values()
            .filter(|t| t.is_queued())
            .cloned()
            .collect())
    }

    async fn find_active(&self) -> SchedulerResult<Vec<SpecialTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .special_tasks
            .values()
            .filter(|t| t.is_active && !t.is_complete)
            .cloned()
            .collect())
    }

    async fn find_by_queue_entry(&self, queue_entry_id: i64) -> SchedulerResult<Vec<SpecialTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .special_tasks
            .values()
            .filter(|t| t.queue_entry_id == Some(queue_entry_id))
            .cloned()
            .collect())
    }

    async fn find_aborting(&self) -> SchedulerResult<Vec<SpecialTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .special_tasks
            .values()
            .filter(|t| t.aborted && !t.is_complete)
            .cloned()
            .collect())
    }

    async fn activate(&self, id: i64, time_started: DateTime<Utc>) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let task = state.special_task_mut(id)?;
        task.is_active = true;
        task.time_started = Some(time_started);
        Ok(())
    }

    async fn finish(&self, id: i64, success: bool) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let task = state.special_task_mut(id)?;
        task.is_active = false;
        task.is_complete = true;
        task.success = success;
        Ok(())
    }
}

/// 测试中区分进程种类：特殊任务按工作目录后缀区分，其余按pidfile名称区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PidfileType {
    Verify,
    Cleanup,
    Repair,
    Job,
    Gather,
    Parse,
    Archive,
}

impl PidfileType {
    fn classify(working_directory: &str, pidfile_name: &str) -> Option<Self> {
        if working_directory.starts_with("hosts/") {
            // hosts/host1/1-verify
            return match working_directory.rsplit('-').next()? {
                "verify" => Some(Self::Verify),
                "cleanup" => Some(Self::Cleanup),
                "repair" => Some(Self::Repair),
                _ => None,
            };
        }
        match pidfile_name {
            AUTOSERV_PID_FILE => Some(Self::Job),
            CRASHINFO_PID_FILE => Some(Self::Gather),
            PARSER_PID_FILE => Some(Self::Parse),
            ARCHIVER_PID_FILE => Some(Self::Archive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FakePidfile {
    contents: PidfileContents,
    num_processes: usize,
    paired_with: Option<PidfileId>,
}

#[derive(Debug, Default)]
struct FakeDroneState {
    process_capacity: usize,
    pidfiles: HashMap<PidfileId, FakePidfile>,
    /// 已提交但尚未在execute_actions中启动的进程
    future_pidfiles: Vec<PidfileId>,
    last_pidfile: HashMap<PidfileType, PidfileId>,
    process_index: HashMap<Process, PidfileId>,
    killed: HashSet<PidfileId>,
    /// 进程表中已经消失、但pidfile没有写退出码的进程
    dead_processes: HashSet<Process>,
    /// 下一次refresh时移除
    unregistered: HashSet<PidfileId>,
    attached_files: HashMap<String, Vec<(String, String)>>,
    written_lines: Vec<(String, Vec<String>)>,
    copies: Vec<(String, String)>,
    executed: Vec<RunRequest>,
    orphans: Vec<Process>,
    next_pid: u32,
    temporary_path_counter: u32,
}

/// 由测试驱动的DroneManager
///
/// `run` 返回的pidfile在下一次 `execute_actions` 时获得进程；进程一直运行，
/// 直到测试调用 `finish_process` 或 `finish_specific_process`。
#[derive(Debug, Clone)]
pub struct FakeDroneManager {
    state: Arc<Mutex<FakeDroneState>>,
}

pub const FAKE_DRONE_HOSTNAME: &str = "drone1";

impl FakeDroneManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeDroneState {
                process_capacity: 100,
                next_pid: 1000,
                ..Default::default()
            })),
        }
    }

    pub fn with_orphans(self, orphans: Vec<Process>) -> Self {
        self.state.lock().unwrap().orphans = orphans;
        self
    }

    /// 模拟进程未写退出码就消失
    pub fn mark_process_dead(&self, process: Process) {
        self.state.lock().unwrap().dead_processes.insert(process);
    }

    pub fn set_process_capacity(&self, capacity: usize) {
        self.state.lock().unwrap().process_capacity = capacity;
    }

    /// 结束某一类中最近启动的进程
    pub fn finish_process(&self, pidfile_type: PidfileType, exit_status: i32) {
        let mut state = self.state.lock().unwrap();
        let pidfile_id = state
            .last_pidfile
            .get(&pidfile_type)
            .cloned()
            .unwrap_or_else(|| panic!("没有 {pidfile_type:?} 类型的进程"));
        Self::set_exit_status(&mut state, &pidfile_id, exit_status);
    }

    pub fn finish_specific_process(&self, working_directory: &str, pidfile_name: &str) {
        let pidfile_id = self.get_pidfile_id_from(working_directory, pidfile_name);
        let mut state = self.state.lock().unwrap();
        Self::set_exit_status(&mut state, &pidfile_id, 0);
    }

    fn set_exit_status(state: &mut FakeDroneState, pidfile_id: &PidfileId, exit_status: i32) {
        let pidfile = state
            .pidfiles
            .get_mut(pidfile_id)
            .unwrap_or_else(|| panic!("pidfile不存在: {pidfile_id}"));
        pidfile.contents.exit_status = Some(exit_status);
        pidfile.contents.num_tests_failed = Some(0);
    }

    /// 直接写入pidfile内容，用于模拟恢复场景中已经存在的进程
    pub fn set_pidfile_contents(
        &self,
        working_directory: &str,
        pidfile_name: &str,
        contents: PidfileContents,
    ) {
        let pidfile_id = self.get_pidfile_id_from(working_directory, pidfile_name);
        let mut state = self.state.lock().unwrap();
        if let Some(process) = &contents.process {
            state
                .process_index
                .insert(process.clone(), pidfile_id.clone());
        }
        state.pidfiles.entry(pidfile_id).or_default().contents = contents;
    }

    pub fn was_last_process_killed(&self, pidfile_type: PidfileType) -> bool {
        let state = self.state.lock().unwrap();
        state
            .last_pidfile
            .get(&pidfile_type)
            .map(|id| state.killed.contains(id))
            .unwrap_or(false)
    }

    pub fn was_process_executed(&self, working_directory: &str, pidfile_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .any(|r| r.working_directory == working_directory && r.pidfile_name == pidfile_name)
    }

    pub fn executed_commands(&self) -> Vec<RunRequest> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn nonfinished_pidfile_ids(&self) -> Vec<PidfileId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<PidfileId> = state
            .pidfiles
            .iter()
            .filter(|(_, p)| p.contents.exit_status.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn running_pidfile_ids(&self) -> Vec<PidfileId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<PidfileId> = state
            .pidfiles
            .iter()
            .filter(|(_, p)| p.contents.exit_status.is_none() && p.contents.process.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 仍被跟踪的pidfile，用于检查泄漏
    pub fn tracked_pidfile_ids(&self) -> Vec<PidfileId> {
        let mut ids: Vec<PidfileId> = self.state.lock().unwrap().pidfiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn paired_pidfile_of(&self, working_directory: &str, pidfile_name: &str) -> Option<PidfileId> {
        let pidfile_id = self.get_pidfile_id_from(working_directory, pidfile_name);
        self.state
            .lock()
            .unwrap()
            .pidfiles
            .get(&pidfile_id)
            .and_then(|p| p.paired_with.clone())
    }

    /// 某个结果目录下附加的文件：路径到内容
    pub fn attached_files(&self, working_directory: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .attached_files
            .get(working_directory)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn written_lines(&self, file_path: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .written_lines
            .iter()
            .filter(|(path, _)| path == file_path)
            .flat_map(|(_, lines)| lines.iter().cloned())
            .collect()
    }

    /// 复制记录：(源路径, 目标路径)
    pub fn copies(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().copies.clone()
    }

    fn pidfile_id(working_directory: &str, pidfile_name: &str) -> PidfileId {
        PidfileId::new(format!("{working_directory}/{pidfile_name}"))
    }
}

impl Default for FakeDroneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DroneManager for FakeDroneManager {
    async fn refresh(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let unregistered: Vec<PidfileId> = state.unregistered.drain().collect();
        for pidfile_id in unregistered {
            state.pidfiles.remove(&pidfile_id);
        }
        Ok(())
    }

    async fn execute_actions(&self) -> SchedulerResult<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let future: Vec<PidfileId> = state.future_pidfiles.drain(..).collect();
        for pidfile_id in future {
            state.next_pid += 1;
            let process = Process::new(FAKE_DRONE_HOSTNAME, state.next_pid);
            if let Some(pidfile) = state.pidfiles.get_mut(&pidfile_id) {
                pidfile.contents.process = Some(process.clone());
                state.process_index.insert(process, pidfile_id);
            }
        }
        Ok(())
    }

    async fn run(&self, request: RunRequest) -> SchedulerResult<PidfileId> {
        let pidfile_id = Self::pidfile_id(&request.working_directory, &request.pidfile_name);
        let mut state = self.state.lock().unwrap();
        state.pidfiles.insert(
            pidfile_id.clone(),
            FakePidfile {
                contents: PidfileContents::default(),
                num_processes: request.num_processes,
                paired_with: request.paired_with_pidfile.clone(),
            },
        );
        state.unregistered.remove(&pidfile_id);
        state.future_pidfiles.push(pidfile_id.clone());
        if let Some(pidfile_type) =
            PidfileType::classify(&request.working_directory, &request.pidfile_name)
        {
            state.last_pidfile.insert(pidfile_type, pidfile_id.clone());
        }
        state.executed.push(request);
        Ok(pidfile_id)
    }

    fn get_pidfile_id_from(&self, execution_tag: &str, pidfile_name: &str) -> PidfileId {
        Self::pidfile_id(execution_tag, pidfile_name)
    }

    async fn register_pidfile(&self, pidfile_id: &PidfileId) {
        self.state
            .lock()
            .unwrap()
            .pidfiles
            .entry(pidfile_id.clone())
            .or_default();
    }

    async fn unregister_pidfile(&self, pidfile_id: &PidfileId) {
        self.state
            .lock()
            .unwrap()
            .unregistered
            .insert(pidfile_id.clone());
    }

    async fn declare_process_count(&self, pidfile_id: &PidfileId, num_processes: usize) {
        if let Some(pidfile) = self.state.lock().unwrap().pidfiles.get_mut(pidfile_id) {
            pidfile.num_processes = num_processes;
        }
    }

    async fn get_pidfile_contents(
        &self,
        pidfile_id: &PidfileId,
        _use_second_read: bool,
    ) -> SchedulerResult<PidfileContents> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pidfiles
            .get(pidfile_id)
            .map(|p| p.contents.clone())
            .unwrap_or_default())
    }

    async fn is_process_running(&self, process: &Process) -> bool {
        !self.state.lock().unwrap().dead_processes.contains(process)
    }

    async fn kill_process(&self, process: &Process) {
        let mut state = self.state.lock().unwrap();
        if let Some(pidfile_id) = state.process_index.get(process).cloned() {
            state.killed.insert(pidfile_id.clone());
            if state.pidfiles.contains_key(&pidfile_id) {
                Self::set_exit_status(&mut state, &pidfile_id, 271);
            }
        }
    }

    async fn max_runnable_processes(&self) -> usize {
        let capacity = self.state.lock().unwrap().process_capacity;
        capacity.saturating_sub(self.total_running_processes().await)
    }

    async fn total_running_processes(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .pidfiles
            .values()
            .filter(|p| p.contents.exit_status.is_none())
            .map(|p| p.num_processes)
            .sum()
    }

    async fn get_orphaned_autoserv_processes(&self) -> Vec<Process> {
        self.state.lock().unwrap().orphans.clone()
    }

    async fn get_temporary_path(&self, base_name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.temporary_path_counter += 1;
        format!("drone_tmp/{base_name}.{}", state.temporary_path_counter)
    }

    fn absolute_path(&self, path: &str) -> String {
        format!("absolute/{path}")
    }

    async fn copy_to_results_repository(
        &self,
        _process: &Process,
        source_path: &str,
        destination_path: Option<&str>,
    ) {
        self.state.lock().unwrap().copies.push((
            source_path.to_string(),
            destination_path.unwrap_or(source_path).to_string(),
        ));
    }

    async fn copy_results_on_drone(
        &self,
        _process: &Process,
        source_path: &str,
        destination_path: &str,
    ) {
        self.state
            .lock()
            .unwrap()
            .copies
            .push((source_path.to_string(), destination_path.to_string()));
    }

    async fn attach_file_to_execution(
        &self,
        results_dir: &str,
        file_contents: &str,
        file_path: Option<&str>,
    ) -> String {
        let path = file_path
            .map(str::to_string)
            .unwrap_or_else(|| format!("{results_dir}/attached_control"));
        self.state
            .lock()
            .unwrap()
            .attached_files
            .entry(results_dir.to_string())
            .or_default()
            .push((path.clone(), file_contents.to_string()));
        path
    }

    async fn write_lines_to_file(
        &self,
        file_path: &str,
        lines: &[String],
        _paired_with_process: Option<&Process>,
    ) {
        self.state
            .lock()
            .unwrap()
            .written_lines
            .push((file_path.to_string(), lines.to_vec()));
    }
}

/// 手动推进的时钟
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// 记录所有发送的通知
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationSink {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.subject.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn send(&self, notification: &Notification) -> SchedulerResult<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{HostBuilder, QueueEntryBuilder};

    #[tokio::test]
    async fn test_fake_drone_process_lifecycle() {
        let drone = FakeDroneManager::new();
        let request = RunRequest::new(vec!["autoserv".into()], "hosts/host1/1-verify", AUTOSERV_PID_FILE);
        let pidfile_id = drone.run(request).await.unwrap();

        let contents = drone.get_pidfile_contents(&pidfile_id, false).await.unwrap();
        assert!(contents.is_not_started());
        assert_eq!(drone.max_runnable_processes().await, 99);

        drone.execute_actions().await.unwrap();
        assert_eq!(drone.running_pidfile_ids(), vec![pidfile_id.clone()]);

        drone.finish_process(PidfileType::Verify, 256);
        let contents = drone.get_pidfile_contents(&pidfile_id, false).await.unwrap();
        assert_eq!(contents.exit_status, Some(256));
        assert_eq!(drone.max_runnable_processes().await, 100);

        drone.unregister_pidfile(&pidfile_id).await;
        assert_eq!(drone.tracked_pidfile_ids().len(), 1);
        drone.refresh().await.unwrap();
        assert!(drone.tracked_pidfile_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fake_drone_kill_marks_signal_exit() {
        let drone = FakeDroneManager::new();
        let request = RunRequest::new(vec!["autoserv".into()], "1-user/host1", AUTOSERV_PID_FILE);
        let pidfile_id = drone.run(request).await.unwrap();
        drone.execute_actions().await.unwrap();

        let process = drone
            .get_pidfile_contents(&pidfile_id, false)
            .await
            .unwrap()
            .process
            .unwrap();
        drone.kill_process(&process).await;
        assert!(drone.was_last_process_killed(PidfileType::Job));
        assert!(drone.running_pidfile_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mock_database_ready_hosts_exclude_active_entries() {
        let db = MockDatabase::new();
        db.insert_host(HostBuilder::new().with_id(1).with_hostname("host1").build());
        db.insert_host(HostBuilder::new().with_id(2).with_hostname("host2").build());
        db.insert_host(HostBuilder::new().with_id(3).with_hostname("host3").locked().build());
        db.insert_entry(
            QueueEntryBuilder::new()
                .with_host(2)
                .with_status(HostQueueEntryStatus::Running)
                .build(),
        );

        let ready = HostRepository::find_ready(&db).await.unwrap();
        let ids: Vec<i64> = ready.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now() - start, Duration::minutes(5));
    }
}
