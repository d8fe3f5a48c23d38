use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{HostQueueEntry, HostQueueEntryStatus, HostStatus, Job, SpecialTask, SpecialTaskKind};
use scheduler_drone::Process;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Agent;
use crate::cleanup::PeriodicCleanup;
use crate::context::SchedulerContext;
use crate::host_scheduler::{order_pending_entries, AtomicPlacement, HostScheduler};
use crate::lifecycle;
use crate::metrics;
use crate::tasks::{PostJobKind, PostJobTask, QueueTask, SpecialAgentTask, Task};

/// 需要由Agent驱动的条目状态
const QUEUE_ENTRY_TASK_STATUSES: [HostQueueEntryStatus; 5] = [
    HostQueueEntryStatus::Starting,
    HostQueueEntryStatus::Running,
    HostQueueEntryStatus::Gathering,
    HostQueueEntryStatus::Parsing,
    HostQueueEntryStatus::Archiving,
];

const ORPHANS_SUBJECT: &str = "Unrecovered orphan autoserv processes remain";

/// 调度主循环
///
/// 所有状态推进都发生在 [`Dispatcher::tick`] 中，调用方负责在两次tick之间休眠。
/// 同一台主机同一时刻至多被一个Agent占用。
pub struct Dispatcher {
    ctx: Arc<SchedulerContext>,
    agents: Vec<Agent>,
    host_agents: HashMap<i64, HashSet<u64>>,
    queue_entry_agents: HashMap<i64, HashSet<u64>>,
    host_scheduler: HostScheduler,
    periodic_cleanup: PeriodicCleanup,
    next_agent_id: u64,
    tick_count: u64,
}

impl Dispatcher {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let periodic_cleanup = PeriodicCleanup::new(&ctx);
        Self {
            ctx,
            agents: Vec::new(),
            host_agents: HashMap::new(),
            queue_entry_agents: HashMap::new(),
            host_scheduler: HostScheduler::new(),
            periodic_cleanup,
            next_agent_id: 1,
            tick_count: 0,
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn add_agent(&mut self, task: Task) -> u64 {
        let agent_id = self.next_agent_id;
        self.next_agent_id += 1;

        let agent = Agent::new(agent_id, task);
        for host_id in agent.host_ids() {
            self.host_agents.entry(*host_id).or_default().insert(agent_id);
        }
        for entry_id in agent.queue_entry_ids() {
            self.queue_entry_agents
                .entry(*entry_id)
                .or_default()
                .insert(agent_id);
        }
        debug!("添加 Agent {} ({})", agent_id, agent.name());
        self.agents.push(agent);
        agent_id
    }

    fn remove_agent(&mut self, agent_id: u64) {
        let Some(index) = self.agents.iter().position(|a| a.id() == agent_id) else {
            return;
        };
        let agent = self.agents.remove(index);
        for host_id in agent.host_ids() {
            unregister(&mut self.host_agents, *host_id, agent_id);
        }
        for entry_id in agent.queue_entry_ids() {
            unregister(&mut self.queue_entry_agents, *entry_id, agent_id);
        }
    }

    fn remove_finished_agents(&mut self) {
        let finished: Vec<u64> = self
            .agents
            .iter()
            .filter(|a| a.is_done())
            .map(|a| a.id())
            .collect();
        for agent_id in finished {
            self.remove_agent(agent_id);
        }
    }

    pub fn host_has_agent(&self, host_id: i64) -> bool {
        self.host_agents
            .get(&host_id)
            .map_or(false, |agents| !agents.is_empty())
    }

    pub fn agents_for_entry(&self, entry_id: i64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .queue_entry_agents
            .get(&entry_id)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn agents_for_special_task(&self, task_id: i64) -> Vec<u64> {
        self.agents
            .iter()
            .filter(|a| a.task().as_agent_task().special_task_id() == Some(task_id))
            .map(|a| a.id())
            .collect()
    }

    async fn abort_agent(&mut self, agent_id: u64) {
        let ctx = self.ctx.clone();
        let Some(agent) = self.agents.iter_mut().find(|a| a.id() == agent_id) else {
            return;
        };
        if let Err(e) = agent.abort(&ctx).await {
            error!("中止 Agent {} ({}) 失败: {}", agent_id, agent.name(), e);
            metrics::record_agent_error(agent.name());
        }
    }

    /// 启动恢复：接管上次运行留下的进程和中间状态
    #[instrument(skip(self))]
    pub async fn initialize(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        info!("调度器初始化，开始恢复");
        ctx.drone_manager.refresh().await?;
        self.periodic_cleanup.initialize(&ctx).await?;

        self.recover_processes().await?;
        self.recover_pending_entries().await?;
        self.check_for_unrecovered_verifying_entries().await?;
        self.reverify_hosts_where(
            &[
                HostStatus::Repairing,
                HostStatus::Verifying,
                HostStatus::Cleaning,
            ],
            false,
        )
        .await?;
        if ctx.config.reverify_repair_failed_hosts {
            self.reverify_hosts_where(&[HostStatus::RepairFailed], true)
                .await?;
        }

        ctx.drone_manager.execute_actions().await?;
        ctx.email.send_queued().await?;
        info!("恢复完成，当前 {} 个 Agent", self.agents.len());
        Ok(())
    }

    async fn recover_processes(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let mut tasks = self.queue_entry_tasks(true).await?;
        for special_task in ctx.repos.special_tasks.find_active().await? {
            tasks.push(SpecialAgentTask::load(&ctx, special_task).await?.into());
        }

        // 先注册所有pidfile，刷新之后才能读到内容
        for task in &tasks {
            task.as_agent_task().register_necessary_pidfiles(&ctx).await;
        }
        ctx.drone_manager.refresh().await?;

        let mut orphans = ctx.drone_manager.get_orphaned_autoserv_processes().await;
        for mut task in tasks {
            task.recover(&ctx).await?;
            let process = match task.as_agent_task_mut().core_mut().monitor.as_mut() {
                Some(monitor) => monitor.get_process(&ctx).await,
                None => None,
            };
            let agent_id = self.add_agent(task);
            if let Some(process) = process {
                orphans.retain(|orphan| *orphan != process);
                if let Some(agent) = self.agents.iter_mut().find(|a| a.id() == agent_id) {
                    agent.mark_started();
                }
            }
        }
        self.check_for_remaining_orphans(&orphans)
    }

    fn check_for_remaining_orphans(&self, orphans: &[Process]) -> SchedulerResult<()> {
        if orphans.is_empty() {
            return Ok(());
        }
        let listing = orphans
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        warn!("{} 个孤儿autoserv进程未被恢复:\n{}", orphans.len(), listing);
        self.ctx.email.enqueue_admin(ORPHANS_SUBJECT, &listing);
        if self.ctx.config.die_on_orphans {
            return Err(SchedulerError::recovery_error(ORPHANS_SUBJECT));
        }
        Ok(())
    }

    async fn recover_pending_entries(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let pending = ctx
            .repos
            .entries
            .find_by_statuses(&[HostQueueEntryStatus::Pending])
            .await?;
        for entry in pending {
            if !self.agents_for_entry(entry.id).is_empty() {
                continue;
            }
            info!("恢复 Pending 条目 {}", entry.entry_description());
            lifecycle::on_pending(&ctx, entry.id).await?;
        }
        Ok(())
    }

    /// Verifying 条目必须有未完成的验证或清理任务
    async fn check_for_unrecovered_verifying_entries(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        let verifying = ctx
            .repos
            .entries
            .find_by_statuses(&[HostQueueEntryStatus::Verifying])
            .await?;
        let mut unrecovered = Vec::new();
        for entry in verifying {
            let has_task = ctx
                .repos
                .special_tasks
                .find_by_queue_entry(entry.id)
                .await?
                .iter()
                .any(|t| {
                    matches!(t.task, SpecialTaskKind::Verify | SpecialTaskKind::Cleanup)
                        && !t.is_complete
                });
            if !has_task {
                unrecovered.push(entry.entry_description());
            }
        }
        if unrecovered.is_empty() {
            return Ok(());
        }
        Err(SchedulerError::recovery_error(format!(
            "{} unrecovered verifying host queue entries:\n{}",
            unrecovered.len(),
            unrecovered.join("\n")
        )))
    }

    async fn reverify_hosts_where(
        &mut self,
        statuses: &[HostStatus],
        notify: bool,
    ) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let queued_hosts: HashSet<i64> = ctx
            .repos
            .special_tasks
            .find_queued()
            .await?
            .iter()
            .map(|t| t.host_id)
            .collect();

        for host in ctx.repos.hosts.find_by_statuses(statuses).await? {
            if host.locked || host.invalid {
                continue;
            }
            if self.host_has_agent(host.id) || queued_hosts.contains(&host.id) {
                continue;
            }
            if notify {
                let subject = format!("Host {} is in {} state", host.hostname, host.status);
                ctx.email.enqueue_admin(&subject, "Scheduling a cleanup to reverify it");
                info!("{}，安排清理", subject);
            } else {
                warn!(
                    "恢复处于 {} 状态的主机 {}，这通常意味着调度器缺陷",
                    host.status, host.hostname
                );
            }
            lifecycle::create_special_task(&ctx, host.id, SpecialTaskKind::Cleanup, None, None)
                .await?;
        }
        Ok(())
    }

    /// 一次调度循环
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> SchedulerResult<()> {
        let tick_started = Instant::now();
        self.tick_count += 1;
        let ctx = self.ctx.clone();

        ctx.drone_manager.refresh().await?;
        self.schedule_new_jobs().await?;
        self.schedule_running_host_queue_entries().await?;
        self.schedule_delay_tasks().await?;
        self.schedule_special_tasks().await?;
        self.handle_agents().await?;
        self.find_aborting().await?;
        if self.periodic_cleanup.run_cleanup_maybe(&ctx).await? {
            debug!("周期清理完成");
        }

        ctx.drone_manager.execute_actions().await?;
        ctx.email.send_queued().await?;
        metrics::set_agent_gauges(
            self.agents.len(),
            ctx.drone_manager.total_running_processes().await,
        );
        metrics::record_tick(tick_started.elapsed());
        Ok(())
    }

    async fn schedule_new_jobs(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let mut pending: Vec<HostQueueEntry> = ctx
            .repos
            .entries
            .find_pending()
            .await?
            .into_iter()
            .filter(|e| !e.aborted)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut job_ids: Vec<i64> = pending.iter().map(|e| e.job_id).collect();
        job_ids.sort_unstable();
        job_ids.dedup();
        let jobs: HashMap<i64, Job> = ctx
            .repos
            .jobs
            .find_by_ids(&job_ids)
            .await?
            .into_iter()
            .map(|j| (j.id, j))
            .collect();

        order_pending_entries(&mut pending, &jobs);
        self.host_scheduler.refresh(&ctx, &pending, &jobs).await?;

        for entry in &pending {
            let Some(job) = jobs.get(&entry.job_id) else {
                warn!("{} 的作业不存在", entry.entry_description());
                continue;
            };
            if let Err(e) = self.schedule_entry(&ctx, entry, job).await {
                error!("调度 {} 失败: {}", entry.entry_description(), e);
            }
        }
        Ok(())
    }

    async fn schedule_entry(
        &mut self,
        ctx: &SchedulerContext,
        entry: &HostQueueEntry,
        job: &Job,
    ) -> SchedulerResult<()> {
        if entry.atomic_group_id.is_some() && entry.host_id.is_none() {
            return self.schedule_atomic_group(ctx, entry, job).await;
        }
        if entry.is_hostless() {
            return self.schedule_hostless_job(ctx, entry).await;
        }
        let Some(host) = self.host_scheduler.schedule_entry(entry) else {
            return Ok(());
        };
        if self.host_has_agent(host.id) {
            return Ok(());
        }
        run_queue_entry(ctx, entry, host.id).await
    }

    async fn schedule_hostless_job(
        &mut self,
        ctx: &SchedulerContext,
        entry: &HostQueueEntry,
    ) -> SchedulerResult<()> {
        lifecycle::set_status(ctx, entry.id, HostQueueEntryStatus::Starting).await?;
        let task = QueueTask::load(ctx, &[entry.id]).await?;
        self.add_agent(task.into());
        Ok(())
    }

    /// 第一台主机分配给原条目，其余主机各自克隆一个新条目
    async fn schedule_atomic_group(
        &mut self,
        ctx: &SchedulerContext,
        entry: &HostQueueEntry,
        job: &Job,
    ) -> SchedulerResult<()> {
        let hosts = match self.host_scheduler.find_eligible_atomic_group(entry, job) {
            AtomicPlacement::Hosts(hosts) => hosts,
            AtomicPlacement::Unschedulable => return Ok(()),
            AtomicPlacement::Impossible => {
                return lifecycle::set_status(ctx, entry.id, HostQueueEntryStatus::Aborted).await;
            }
        };
        let Some((first, rest)) = hosts.split_first() else {
            return Ok(());
        };
        info!(
            "{} 分配到原子组的 {} 台主机",
            entry.entry_description(),
            hosts.len()
        );

        for host in rest {
            let clone = HostQueueEntry {
                id: 0,
                host_id: None,
                status: HostQueueEntryStatus::Queued,
                aborted: false,
                execution_subdir: String::new(),
                started_on: None,
                ..entry.clone()
            };
            let created = ctx.repos.entries.create(&clone).await?;
            run_queue_entry(ctx, &created, host.id).await?;
        }
        run_queue_entry(ctx, entry, first.id).await
    }

    async fn schedule_running_host_queue_entries(&mut self) -> SchedulerResult<()> {
        for task in self.queue_entry_tasks(false).await? {
            self.add_agent(task);
        }
        Ok(())
    }

    async fn schedule_delay_tasks(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let waiting = ctx
            .repos
            .entries
            .find_by_statuses(&[HostQueueEntryStatus::Waiting])
            .await?;
        for entry in waiting {
            match lifecycle::schedule_delayed_callback_task(&ctx, entry.id).await {
                Ok(Some(task)) => {
                    self.add_agent(task.into());
                }
                Ok(None) => {}
                Err(e) => error!("为 {} 安排延迟调用失败: {}", entry.entry_description(), e),
            }
        }
        Ok(())
    }

    /// 为处于需要Agent状态但还没有Agent的条目创建任务，同组条目共享一个任务
    ///
    /// `strict` 用于启动恢复：任何不一致都直接返回错误。
    async fn queue_entry_tasks(&self, strict: bool) -> SchedulerResult<Vec<Task>> {
        let ctx = self.ctx.clone();
        let entries = ctx
            .repos
            .entries
            .find_by_statuses(&QUEUE_ENTRY_TASK_STATUSES)
            .await?;

        let mut used_entries = HashSet::new();
        let mut used_hosts = HashSet::new();
        let mut tasks = Vec::new();
        for entry in entries {
            if used_entries.contains(&entry.id) || !self.agents_for_entry(entry.id).is_empty() {
                continue;
            }
            let task = match self.task_for_queue_entry(&ctx, &entry, &used_hosts).await {
                Ok(task) => task,
                Err(e) if !strict => {
                    error!("无法为 {} 创建任务: {}", entry.entry_description(), e);
                    used_entries.insert(entry.id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            used_entries.extend(task.as_agent_task().queue_entry_ids().iter().copied());
            used_hosts.extend(task.as_agent_task().host_ids().iter().copied());
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn task_for_queue_entry(
        &self,
        ctx: &SchedulerContext,
        entry: &HostQueueEntry,
        used_hosts: &HashSet<i64>,
    ) -> SchedulerResult<Task> {
        let group: Vec<i64> = if entry.is_hostless() {
            vec![entry.id]
        } else {
            lifecycle::get_group_entries(ctx, entry)
                .await?
                .into_iter()
                .filter(|e| e.status == entry.status)
                .map(|e| e.id)
                .collect()
        };

        let task: Task = match entry.status {
            HostQueueEntryStatus::Starting | HostQueueEntryStatus::Running => {
                QueueTask::load(ctx, &group).await?.into()
            }
            HostQueueEntryStatus::Gathering => {
                PostJobTask::load(ctx, PostJobKind::GatherLogs, &group).await?.into()
            }
            HostQueueEntryStatus::Parsing => {
                PostJobTask::load(ctx, PostJobKind::FinalReparse, &group).await?.into()
            }
            HostQueueEntryStatus::Archiving => {
                PostJobTask::load(ctx, PostJobKind::ArchiveResults, &group).await?.into()
            }
            status => {
                return Err(SchedulerError::invalid_state(format!(
                    "{} 处于 {} 状态，不需要Agent",
                    entry.entry_description(),
                    status
                )));
            }
        };

        for host_id in task.as_agent_task().host_ids() {
            if self.host_has_agent(*host_id) || used_hosts.contains(host_id) {
                return Err(SchedulerError::invalid_state(format!(
                    "调度 {} 时主机 {} 已经有Agent",
                    entry.entry_description(),
                    host_id
                )));
            }
        }
        Ok(task)
    }

    /// 修复优先于清理，清理优先于验证
    async fn schedule_special_tasks(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let mut queued = ctx.repos.special_tasks.find_queued().await?;
        queued.sort_by_key(|t| t.task.schedule_order());

        let mut active_entries_by_host: HashMap<i64, Vec<i64>> = HashMap::new();
        for entry in ctx.repos.entries.find_active().await? {
            if let Some(host_id) = entry.host_id {
                active_entries_by_host.entry(host_id).or_default().push(entry.id);
            }
        }

        for special_task in queued {
            if special_task.aborted || !self.agents_for_special_task(special_task.id).is_empty() {
                continue;
            }
            if self.host_has_agent(special_task.host_id) {
                continue;
            }
            let host = match ctx.host(special_task.host_id).await {
                Ok(host) => host,
                Err(e) => {
                    error!("特殊任务 {} 的主机无法加载: {}", special_task.id, e);
                    continue;
                }
            };
            if host.locked {
                continue;
            }
            let busy = active_entries_by_host
                .get(&host.id)
                .map_or(false, |ids| ids.iter().any(|id| Some(*id) != special_task.queue_entry_id));
            if busy {
                continue;
            }

            let task_id = special_task.id;
            match SpecialAgentTask::load(&ctx, special_task).await {
                Ok(task) => {
                    self.add_agent(task.into());
                }
                Err(e) => error!("无法加载特殊任务 {}: {}", task_id, e),
            }
        }
        Ok(())
    }

    async fn handle_agents(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let aborting: HashSet<i64> = ctx
            .repos
            .entries
            .find_aborting()
            .await?
            .iter()
            .map(|e| e.id)
            .collect();

        let mut num_started_this_cycle = 0;
        let mut have_reached_limit = false;
        for agent in self.agents.iter_mut() {
            if !agent.is_started() {
                // 同一tick里中止优先于首次启动；后处理任务不受中止影响
                let honors_abort = matches!(agent.task(), Task::Queue(_) | Task::Special(_));
                if honors_abort && agent.queue_entry_ids().iter().any(|id| aborting.contains(id)) {
                    continue;
                }
                if !can_start_agent(&ctx, agent, num_started_this_cycle, have_reached_limit).await {
                    have_reached_limit = true;
                    continue;
                }
                num_started_this_cycle += agent.num_processes();
                metrics::record_agent_started(agent.name());
            }

            if let Err(e) = agent.tick(&ctx).await {
                error!("Agent {} ({}) 执行失败: {}", agent.id(), agent.name(), e);
                metrics::record_agent_error(agent.name());
            }
            if agent.is_done() {
                debug!("Agent {} ({}) 完成", agent.id(), agent.name());
            }
        }
        self.remove_finished_agents();
        Ok(())
    }

    async fn find_aborting(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let mut jobs_to_stop = BTreeSet::new();
        for entry in ctx.repos.entries.find_aborting().await? {
            debug!("处理中止请求 {}", entry.entry_description());
            jobs_to_stop.insert(entry.job_id);
            for agent_id in self.agents_for_entry(entry.id) {
                self.abort_agent(agent_id).await;
            }
            if let Err(e) = lifecycle::abort_entry(&ctx, entry.id).await {
                error!("中止 {} 失败: {}", entry.entry_description(), e);
            }
        }

        for special_task in ctx.repos.special_tasks.find_aborting().await? {
            let task_id = special_task.id;
            if let Err(e) = self.abort_special_task(special_task).await {
                error!("中止特殊任务 {} 失败: {}", task_id, e);
            }
        }

        for job_id in jobs_to_stop {
            lifecycle::stop_if_necessary(&ctx, job_id).await?;
        }
        self.remove_finished_agents();
        Ok(())
    }

    /// 已经在主机上运行过的任务被中止后主机状态未知，标记为修复失败
    async fn abort_special_task(&mut self, special_task: SpecialTask) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        info!(
            "中止特殊任务 {} {} (host {})",
            special_task.id, special_task.task, special_task.host_id
        );
        let agent_ids = self.agents_for_special_task(special_task.id);
        if agent_ids.is_empty() {
            ctx.repos.special_tasks.finish(special_task.id, false).await?;
        }
        for agent_id in agent_ids {
            self.abort_agent(agent_id).await;
        }

        if let Some(entry_id) = special_task.queue_entry_id {
            let entry = ctx.entry(entry_id).await?;
            if entry.status == HostQueueEntryStatus::Verifying && !entry.aborted {
                lifecycle::requeue(&ctx, entry_id).await?;
            }
        }
        if special_task.is_active {
            lifecycle::set_host_status(&ctx, special_task.host_id, HostStatus::RepairFailed)
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("agents", &self.agents)
            .field("tick_count", &self.tick_count)
            .finish()
    }
}

fn unregister(index: &mut HashMap<i64, HashSet<u64>>, key: i64, agent_id: u64) {
    if let Some(agents) = index.get_mut(&key) {
        agents.remove(&agent_id);
        if agents.is_empty() {
            index.remove(&key);
        }
    }
}

/// 元主机条目先记录分配的主机，然后安排运行前任务
async fn run_queue_entry(
    ctx: &SchedulerContext,
    entry: &HostQueueEntry,
    host_id: i64,
) -> SchedulerResult<()> {
    if entry.host_id.is_none() {
        lifecycle::set_host(ctx, entry.id, Some(host_id)).await?;
    }
    lifecycle::schedule_pre_job_tasks(ctx, entry.id).await
}

/// 不启动进程的Agent总是可以启动；一旦有Agent被拒绝，本轮后面的多进程Agent都不再启动
async fn can_start_agent(
    ctx: &SchedulerContext,
    agent: &Agent,
    num_started_this_cycle: usize,
    have_reached_limit: bool,
) -> bool {
    let num_processes = agent.num_processes();
    if num_processes == 0 {
        return true;
    }
    if have_reached_limit {
        return false;
    }
    let max_runnable = ctx.drone_manager.max_runnable_processes().await;
    if max_runnable < num_processes {
        debug!(
            "drone容量不足，{} 需要 {} 个进程，只剩 {}",
            agent.name(),
            num_processes,
            max_runnable
        );
        return false;
    }
    // 本轮第一个Agent只要容量够就启动
    if num_started_this_cycle == 0 {
        return true;
    }
    num_started_this_cycle + num_processes <= ctx.config.max_processes_started_per_cycle
}
