use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    Host, HostProtection, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job, SpecialTask,
    SpecialTaskKind,
};
use scheduler_drone::AUTOSERV_PID_FILE;
use tracing::info;

use super::{
    autoserv_command_line, timestamp, write_host_keyvals, write_keyval_after_job, AgentTask,
    TaskCore,
};
use crate::context::SchedulerContext;
use crate::lifecycle;

/// 对应数据库中一条特殊任务（验证、清理、修复）的Agent任务
pub struct SpecialAgentTask {
    core: TaskCore,
    task: SpecialTask,
    host: Host,
    queue_entry: Option<HostQueueEntry>,
    job: Option<Job>,
}

impl SpecialAgentTask {
    pub async fn load(ctx: &SchedulerContext, task: SpecialTask) -> SchedulerResult<Self> {
        let host = ctx.host(task.host_id).await?;
        let (queue_entry, job) = match task.queue_entry_id {
            Some(entry_id) => {
                let entry = ctx.entry(entry_id).await?;
                let job = ctx.job(entry.job_id).await?;
                (Some(entry), Some(job))
            }
            None => (None, None),
        };

        let mut core = TaskCore::new(None);
        core.host_ids = vec![host.id];
        // 修复任务不关联条目：条目被中止时修复继续进行
        if task.task != SpecialTaskKind::Repair {
            core.queue_entry_ids = queue_entry.iter().map(|e| e.id).collect();
        }

        Ok(Self {
            core,
            task,
            host,
            queue_entry,
            job,
        })
    }

    pub fn kind(&self) -> SpecialTaskKind {
        self.task.task
    }

    fn keyval_path(&self) -> String {
        format!("{}/keyval", self.working_directory())
    }

    /// 修复失败后让非元主机条目直接失败，并把日志放到作业结果目录
    async fn fail_queue_entry(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let Some(entry) = &self.queue_entry else {
            return Ok(());
        };
        // 元主机条目会被重新分配
        if entry.is_metahost() {
            return Ok(());
        }
        let entry = ctx.entry(entry.id).await?;
        if entry.status != HostQueueEntryStatus::Queued || entry.host_id.is_none() {
            // 已被中止
            return Ok(());
        }

        lifecycle::set_execution_subdir(ctx, entry.id, None).await?;
        let entry = ctx.entry(entry.id).await?;
        let job = ctx.job(entry.job_id).await?;
        let execution_tag = entry.execution_tag(&job);

        let working_directory = self.working_directory();
        let keyval_path = self.keyval_path();
        if let Some(monitor) = self.core.monitor.as_mut() {
            write_keyval_after_job(
                ctx,
                monitor,
                &keyval_path,
                "job_queued",
                timestamp(job.created_on),
            )
            .await;
            write_keyval_after_job(ctx, monitor, &keyval_path, "job_finished", timestamp(ctx.now()))
                .await;
            monitor
                .try_copy_results_on_drone(
                    ctx,
                    &format!("{working_directory}/"),
                    &format!("{execution_tag}/"),
                )
                .await;
        }

        let pidfile_id = ctx
            .drone_manager
            .get_pidfile_id_from(&execution_tag, AUTOSERV_PID_FILE);
        ctx.drone_manager.register_pidfile(&pidfile_id).await;

        let status = if job.parse_failed_repair {
            HostQueueEntryStatus::Parsing
        } else if ctx.config.archive_results {
            HostQueueEntryStatus::Archiving
        } else {
            HostQueueEntryStatus::Failed
        };
        lifecycle::set_status(ctx, entry.id, status).await
    }

    /// 验证/清理失败：保留日志，放回队列并安排修复
    async fn pre_job_failed(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if let Some(entry) = self.queue_entry.clone().filter(|e| !e.is_metahost()) {
            lifecycle::set_execution_subdir(ctx, entry.id, None).await?;
            let entry = ctx.entry(entry.id).await?;
            let job = ctx.job(entry.job_id).await?;

            let working_directory = self.working_directory();
            let log_name = working_directory
                .rsplit('/')
                .next()
                .unwrap_or(&working_directory)
                .to_string();
            let source = format!("{working_directory}/debug/autoserv.DEBUG");
            let destination = format!("{}/{}", entry.execution_tag(&job), log_name);
            if let Some(monitor) = self.core.monitor.as_mut() {
                monitor
                    .try_copy_to_results_repository(ctx, &source, Some(&destination))
                    .await;
            }
        }

        if self.host.protection == HostProtection::DoNotVerify {
            // 这类主机忽略失败
            self.core.success = true;
            return Ok(());
        }

        let entry_id = self.queue_entry.as_ref().map(|e| e.id);
        if let Some(entry_id) = entry_id {
            lifecycle::requeue(ctx, entry_id).await?;

            let repaired_before = ctx
                .repos
                .special_tasks
                .find_by_queue_entry(entry_id)
                .await?
                .iter()
                .any(|t| t.task == SpecialTaskKind::Repair);
            if repaired_before {
                lifecycle::set_host_status(ctx, self.host.id, HostStatus::RepairFailed).await?;
                return self.fail_queue_entry(ctx).await;
            }
        }

        lifecycle::create_special_task(
            ctx,
            self.host.id,
            SpecialTaskKind::Repair,
            entry_id,
            self.task.requested_by.clone(),
        )
        .await?;
        Ok(())
    }

    async fn repair_epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if self.core.success {
            return lifecycle::set_host_status(ctx, self.host.id, HostStatus::Ready).await;
        }
        lifecycle::set_host_status(ctx, self.host.id, HostStatus::RepairFailed).await?;
        if self.queue_entry.is_some() {
            self.fail_queue_entry(ctx).await?;
        }
        Ok(())
    }

    async fn verify_epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.core.success {
            return Ok(());
        }
        match &self.queue_entry {
            Some(entry) => lifecycle::on_pending(ctx, entry.id).await,
            None => lifecycle::set_host_status(ctx, self.host.id, HostStatus::Ready).await,
        }
    }

    async fn cleanup_epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.core.success {
            return Ok(());
        }
        ctx.repos.hosts.update_dirty(self.host.id, false).await?;
        lifecycle::set_host_status(ctx, self.host.id, HostStatus::Ready).await?;

        let (Some(entry), Some(job)) = (&self.queue_entry, &self.job) else {
            return Ok(());
        };
        if job.run_verify && self.host.protection != HostProtection::DoNotVerify {
            lifecycle::create_special_task(
                ctx,
                self.host.id,
                SpecialTaskKind::Verify,
                Some(entry.id),
                None,
            )
            .await?;
            Ok(())
        } else {
            lifecycle::on_pending(ctx, entry.id).await
        }
    }

    /// 一次验证就够了，同一主机上其他手动请求的验证直接结束
    async fn retire_queued_verifies(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        for task in ctx.repos.special_tasks.find_queued().await? {
            if task.host_id == self.host.id
                && task.task == SpecialTaskKind::Verify
                && task.queue_entry_id.is_none()
                && task.id != self.task.id
            {
                ctx.repos.special_tasks.finish(task.id, false).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentTask for SpecialAgentTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        match self.task.task {
            SpecialTaskKind::Verify => "VerifyTask",
            SpecialTaskKind::Cleanup => "CleanupTask",
            SpecialTaskKind::Repair => "RepairTask",
        }
    }

    fn working_directory(&self) -> String {
        self.task.execution_path(&self.host.hostname)
    }

    fn owner_username(&self) -> Option<String> {
        self.task.requested_by.clone()
    }

    fn special_task_id(&self) -> Option<i64> {
        Some(self.task.id)
    }

    async fn command_line(&mut self, ctx: &SchedulerContext) -> SchedulerResult<Vec<String>> {
        let extra_args: Vec<String> = match self.task.task {
            SpecialTaskKind::Verify => vec!["-v".into()],
            SpecialTaskKind::Cleanup => vec!["--cleanup".into()],
            SpecialTaskKind::Repair => vec![
                "-R".into(),
                "--host-protection".into(),
                self.host.protection.attr_name().into(),
            ],
        };
        Ok(autoserv_command_line(
            ctx,
            &self.working_directory(),
            &[self.host.hostname.clone()],
            &extra_args,
            self.job.as_ref(),
            true,
        ))
    }

    async fn prolog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.register_necessary_pidfiles(ctx).await;
        ctx.repos
            .special_tasks
            .activate(self.task.id, ctx.now())
            .await?;
        self.task.is_active = true;
        write_host_keyvals(ctx, &self.working_directory(), &self.host).await?;

        let entry_id = self.queue_entry.as_ref().map(|e| e.id);
        match self.task.task {
            SpecialTaskKind::Repair => {
                info!("开始修复主机 {}", self.host.hostname);
                lifecycle::set_host_status(ctx, self.host.id, HostStatus::Repairing).await?;
            }
            SpecialTaskKind::Verify => {
                info!("开始验证主机 {}", self.host.hostname);
                if let Some(entry_id) = entry_id {
                    lifecycle::set_status(ctx, entry_id, HostQueueEntryStatus::Verifying).await?;
                }
                lifecycle::set_host_status(ctx, self.host.id, HostStatus::Verifying).await?;
                self.retire_queued_verifies(ctx).await?;
            }
            SpecialTaskKind::Cleanup => {
                info!("开始清理主机 {}", self.host.hostname);
                lifecycle::set_host_status(ctx, self.host.id, HostStatus::Cleaning).await?;
                if let Some(entry_id) = entry_id {
                    lifecycle::set_status(ctx, entry_id, HostQueueEntryStatus::Verifying).await?;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.copy_log_file(ctx).await;
        // 中止的任务按失败记录
        ctx.repos
            .special_tasks
            .finish(self.task.id, self.core.success)
            .await?;

        if self.core.monitor.is_some() {
            self.copy_results(ctx).await;
            let pidfile_id = self
                .core
                .monitor
                .as_ref()
                .and_then(|m| m.pidfile_id().cloned());
            if let Some(pidfile_id) = pidfile_id {
                ctx.drone_manager.unregister_pidfile(&pidfile_id).await;
            }
        }
        Ok(())
    }

    async fn epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.cleanup(ctx).await?;

        if self.task.task == SpecialTaskKind::Repair {
            return self.repair_epilog(ctx).await;
        }

        if !self.core.success {
            self.pre_job_failed(ctx).await?;
        }
        match self.task.task {
            SpecialTaskKind::Verify => self.verify_epilog(ctx).await,
            SpecialTaskKind::Cleanup => self.cleanup_epilog(ctx).await,
            SpecialTaskKind::Repair => Ok(()),
        }
    }
}
