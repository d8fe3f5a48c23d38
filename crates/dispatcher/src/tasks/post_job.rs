use std::sync::atomic::Ordering;

use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    Host, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job, RebootAfter, SpecialTaskKind,
};
use scheduler_drone::{
    exit_was_signaled, PidfileId, ARCHIVER_PID_FILE, AUTOSERV_PID_FILE, CRASHINFO_PID_FILE,
    PARSER_PID_FILE,
};
use tracing::{debug, info};

use super::{check_entry_statuses, consistent_execution_tag, AgentTask, TaskCore};
use crate::context::{SchedulerContext, ThrottleKind};
use crate::lifecycle;
use crate::monitor::PidfileRunMonitor;

const ARCHIVING_FAILED_FILE: &str = ".archiver_failed";

/// 作业进程结束之后的三个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostJobKind {
    GatherLogs,
    FinalReparse,
    ArchiveResults,
}

impl PostJobKind {
    /// 处于该阶段的条目状态
    pub fn entry_status(&self) -> HostQueueEntryStatus {
        match self {
            PostJobKind::GatherLogs => HostQueueEntryStatus::Gathering,
            PostJobKind::FinalReparse => HostQueueEntryStatus::Parsing,
            PostJobKind::ArchiveResults => HostQueueEntryStatus::Archiving,
        }
    }

    fn throttle(&self) -> Option<ThrottleKind> {
        match self {
            PostJobKind::GatherLogs => None,
            PostJobKind::FinalReparse => Some(ThrottleKind::Parse),
            PostJobKind::ArchiveResults => Some(ThrottleKind::Archive),
        }
    }
}

/// 复用作业结果目录的后处理任务，和作业的autoserv进程配对运行
pub struct PostJobTask {
    core: TaskCore,
    kind: PostJobKind,
    job: Job,
    entries: Vec<HostQueueEntry>,
    hosts: Vec<Host>,
    working_directory: String,
    autoserv_monitor: PidfileRunMonitor,
}

impl PostJobTask {
    pub async fn load(
        ctx: &SchedulerContext,
        kind: PostJobKind,
        entry_ids: &[i64],
    ) -> SchedulerResult<Self> {
        let entries = ctx.repos.entries.find_by_ids(entry_ids).await?;
        let first = entries.first().ok_or_else(|| {
            scheduler_core::SchedulerError::invalid_state(format!("{kind:?} 没有条目"))
        })?;
        let job = ctx.job(first.job_id).await?;
        let working_directory = consistent_execution_tag(&job, &entries)?;

        let mut hosts = Vec::new();
        for entry in &entries {
            if entry.host_id.is_some() {
                hosts.push(ctx.host_of(entry).await?);
            }
        }

        let log_file_name = match kind {
            PostJobKind::GatherLogs => ".collect_crashinfo.log",
            PostJobKind::FinalReparse => ".parse.log",
            PostJobKind::ArchiveResults => ".archiving.log",
        };
        let mut core = TaskCore::new(Some(log_file_name));
        core.queue_entry_ids = entries.iter().map(|e| e.id).collect();
        if kind == PostJobKind::GatherLogs {
            core.host_ids = hosts.iter().map(|h| h.id).collect();
        }

        let mut autoserv_monitor = PidfileRunMonitor::new();
        autoserv_monitor
            .attach_to_existing_process(ctx, &working_directory, AUTOSERV_PID_FILE, None)
            .await;

        Ok(Self {
            core,
            kind,
            job,
            entries,
            hosts,
            working_directory,
            autoserv_monitor,
        })
    }

    pub fn kind(&self) -> PostJobKind {
        self.kind
    }

    async fn set_all_statuses(
        &self,
        ctx: &SchedulerContext,
        status: HostQueueEntryStatus,
    ) -> SchedulerResult<()> {
        for entry in &self.entries {
            lifecycle::set_status(ctx, entry.id, status).await?;
        }
        Ok(())
    }

    /// 条目的中止标记不一致时按已中止处理
    async fn job_was_aborted(&self, ctx: &SchedulerContext) -> SchedulerResult<bool> {
        let mut was_aborted = None;
        for entry in &self.entries {
            let entry = ctx.entry(entry.id).await?;
            match was_aborted {
                None => was_aborted = Some(entry.aborted),
                Some(aborted) if aborted != entry.aborted => {
                    let descriptions = self
                        .entries
                        .iter()
                        .map(|e| e.entry_description())
                        .collect::<Vec<_>>()
                        .join("\n");
                    ctx.email.enqueue_admin(
                        "Inconsistent abort state",
                        &format!("Queue entries have inconsistent abort state:\n{descriptions}"),
                    );
                    return Ok(true);
                }
                Some(_) => {}
            }
        }
        Ok(was_aborted.unwrap_or(false))
    }

    async fn final_status(&mut self, ctx: &SchedulerContext) -> SchedulerResult<HostQueueEntryStatus> {
        if self.job_was_aborted(ctx).await? {
            return Ok(HostQueueEntryStatus::Aborted);
        }
        Ok(match self.autoserv_monitor.exit_code(ctx).await {
            Some(0) => HostQueueEntryStatus::Completed,
            _ => HostQueueEntryStatus::Failed,
        })
    }

    /// 根据 reboot_after 决定主机是清理还是直接回到 Ready
    async fn reboot_hosts(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let final_status = self.final_status(ctx).await?;
        let (final_success, num_tests_failed) = if self.autoserv_monitor.has_process(ctx).await {
            (
                final_status == HostQueueEntryStatus::Completed,
                self.autoserv_monitor.num_tests_failed(ctx).await,
            )
        } else {
            (false, 0)
        };

        let do_reboot = final_status == HostQueueEntryStatus::Aborted
            || self.job.reboot_after == RebootAfter::Always
            || (self.job.reboot_after == RebootAfter::IfAllTestsPassed
                && final_success
                && num_tests_failed == 0);

        for host in &self.hosts {
            if do_reboot {
                // 清理失败与作业无关，不关联条目
                lifecycle::create_special_task(
                    ctx,
                    host.id,
                    SpecialTaskKind::Cleanup,
                    None,
                    Some(self.job.owner.clone()),
                )
                .await?;
            } else {
                lifecycle::set_host_status(ctx, host.id, HostStatus::Ready).await?;
            }
        }
        Ok(())
    }

    fn can_run_new_process(&self, ctx: &SchedulerContext, kind: ThrottleKind) -> bool {
        let running = ctx.throttle(kind).load(Ordering::SeqCst);
        let limit = ctx.throttle_limit(kind);
        if running >= limit {
            debug!("{} 限流中：{}/{}", self.name(), running, limit);
            return false;
        }
        true
    }

    async fn try_starting_process(
        &mut self,
        ctx: &SchedulerContext,
        kind: ThrottleKind,
    ) -> SchedulerResult<()> {
        if !self.can_run_new_process(ctx, kind) {
            return Ok(());
        }
        self.run_process(ctx).await?;
        if self.core.monitor.is_some() {
            ctx.throttle(kind).fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// 恢复时接管的解析/归档进程同样计入限流
    pub fn count_recovered_process(&self, ctx: &SchedulerContext) {
        if let (Some(kind), Some(_)) = (self.kind.throttle(), self.core.monitor.as_ref()) {
            ctx.throttle(kind).fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn write_archive_failure(&mut self, ctx: &SchedulerContext) {
        if self.core.success || !self.autoserv_monitor.has_process(ctx).await {
            return;
        }
        let exit_code = match self.core.monitor.as_mut() {
            Some(monitor) => monitor.exit_code(ctx).await,
            None => None,
        };
        let exit_code = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "None".into());
        let paired_process = self.autoserv_monitor.get_process(ctx).await;
        ctx.drone_manager
            .write_lines_to_file(
                &format!("{}/{}", self.working_directory, ARCHIVING_FAILED_FILE),
                &[format!("Archiving failed with exit code {exit_code}")],
                paired_process.as_ref(),
            )
            .await;
    }
}

#[async_trait]
impl AgentTask for PostJobTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        match self.kind {
            PostJobKind::GatherLogs => "GatherLogsTask",
            PostJobKind::FinalReparse => "FinalReparseTask",
            PostJobKind::ArchiveResults => "ArchiveResultsTask",
        }
    }

    fn working_directory(&self) -> String {
        self.working_directory.clone()
    }

    fn owner_username(&self) -> Option<String> {
        Some(self.job.owner.clone())
    }

    fn num_processes(&self) -> usize {
        match self.kind {
            PostJobKind::GatherLogs => self.entries.len(),
            // 解析进程不计入drone容量，由自身限流
            PostJobKind::FinalReparse => 0,
            PostJobKind::ArchiveResults => 1,
        }
    }

    fn pidfile_name(&self) -> &'static str {
        match self.kind {
            PostJobKind::GatherLogs => CRASHINFO_PID_FILE,
            PostJobKind::FinalReparse => PARSER_PID_FILE,
            PostJobKind::ArchiveResults => ARCHIVER_PID_FILE,
        }
    }

    fn paired_monitor_mut(&mut self) -> Option<&mut PidfileRunMonitor> {
        Some(&mut self.autoserv_monitor)
    }

    fn paired_pidfile_id(&self) -> Option<PidfileId> {
        self.autoserv_monitor.pidfile_id().cloned()
    }

    async fn command_line(&mut self, ctx: &SchedulerContext) -> SchedulerResult<Vec<String>> {
        let results_dir = ctx.drone_manager.absolute_path(&self.working_directory);
        let command = match self.kind {
            PostJobKind::GatherLogs => {
                let hostnames: Vec<&str> = self.hosts.iter().map(|h| h.hostname.as_str()).collect();
                vec![
                    ctx.config.autoserv_path.clone(),
                    "-p".into(),
                    "--pidfile-label=collect_crashinfo".into(),
                    "--use-existing-results".into(),
                    "--collect-crashinfo".into(),
                    "-m".into(),
                    hostnames.join(","),
                    "-r".into(),
                    results_dir,
                ]
            }
            PostJobKind::FinalReparse => vec![
                ctx.config.parser_path.clone(),
                "--write-pidfile".into(),
                "-l".into(),
                "2".into(),
                "-r".into(),
                "-o".into(),
                "-P".into(),
                results_dir,
            ],
            PostJobKind::ArchiveResults => vec![
                ctx.config.autoserv_path.clone(),
                "-p".into(),
                "--pidfile-label=archiver".into(),
                "-r".into(),
                results_dir,
                "--use-existing-results".into(),
                "--control-filename=control.archive".into(),
                ctx.config.archive_control_path.clone(),
            ],
        };
        Ok(command)
    }

    async fn prolog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let allowed_host = (self.kind == PostJobKind::GatherLogs).then_some(&[HostStatus::Running][..]);
        check_entry_statuses(
            ctx,
            self.name(),
            &self.core.queue_entry_ids,
            &[self.kind.entry_status()],
            allowed_host,
        )
        .await?;
        self.register_necessary_pidfiles(ctx).await;
        Ok(())
    }

    async fn run(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        match self.kind.throttle() {
            Some(kind) => self.try_starting_process(ctx, kind).await,
            None => {
                // 只有autoserv被信号终止或没有退出码时才需要收集崩溃信息
                let exit_code = self.autoserv_monitor.exit_code(ctx).await;
                match exit_code {
                    Some(code) if !exit_was_signaled(code) => self.finished(ctx, true).await,
                    _ => self.run_process(ctx).await,
                }
            }
        }
    }

    async fn tick(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        match self.kind.throttle() {
            Some(kind) if self.core.monitor.is_none() => self.try_starting_process(ctx, kind).await,
            _ => self.tick_monitor(ctx).await,
        }
    }

    async fn finished(&mut self, ctx: &SchedulerContext, success: bool) -> SchedulerResult<()> {
        let was_done = self.core.done;
        self.mark_finished(ctx, success).await?;
        if let Some(kind) = self.kind.throttle() {
            if !was_done && self.core.monitor.is_some() {
                let _ = ctx
                    .throttle(kind)
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            }
        }
        Ok(())
    }

    /// 后处理不能被中止，中止的作业同样需要收集日志和解析结果
    async fn abort(&mut self, _ctx: &SchedulerContext) -> SchedulerResult<()> {
        Ok(())
    }

    async fn epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.cleanup(ctx).await?;
        match self.kind {
            PostJobKind::GatherLogs => {
                self.set_all_statuses(ctx, HostQueueEntryStatus::Parsing).await?;
                self.reboot_hosts(ctx).await
            }
            PostJobKind::FinalReparse => {
                if ctx.config.archive_results {
                    self.set_all_statuses(ctx, HostQueueEntryStatus::Archiving).await
                } else {
                    let status = self.final_status(ctx).await?;
                    self.set_all_statuses(ctx, status).await
                }
            }
            PostJobKind::ArchiveResults => {
                self.write_archive_failure(ctx).await;
                let status = self.final_status(ctx).await?;
                info!("作业 {} 结果归档完成，最终状态 {}", self.job.tag(), status);
                self.set_all_statuses(ctx, status).await
            }
        }
    }
}
