use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{Host, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job};
use tracing::info;

use super::{
    autoserv_command_line, check_entry_statuses, consistent_execution_tag, timestamp,
    write_host_keyvals, write_keyval_after_job, write_keyvals_before_job, AgentTask, TaskCore,
};
use crate::context::SchedulerContext;
use crate::lifecycle;

pub const LOST_PROCESS_ERROR: &str = "Autoserv failed abnormally during execution for this job, \
probably due to a system error on the Autotest server.  Full results may not be available.  Sorry.";

pub const HOSTLESS_SUBDIR: &str = "hostless";

/// 运行作业本身的autoserv进程；无主机作业只在服务端运行
pub struct QueueTask {
    core: TaskCore,
    job: Job,
    entries: Vec<HostQueueEntry>,
    hosts: Vec<Host>,
    hostless: bool,
}

impl QueueTask {
    pub async fn load(ctx: &SchedulerContext, entry_ids: &[i64]) -> SchedulerResult<Self> {
        let mut entries = Vec::with_capacity(entry_ids.len());
        for entry_id in entry_ids {
            entries.push(ctx.entry(*entry_id).await?);
        }
        let first = entries.first().ok_or_else(|| {
            scheduler_core::SchedulerError::invalid_state("QueueTask 至少需要一个条目")
        })?;
        let job = ctx.job(first.job_id).await?;
        let hostless = entries.len() == 1 && first.is_hostless();

        let mut hosts = Vec::new();
        if !hostless {
            for entry in &entries {
                hosts.push(ctx.host_of(entry).await?);
            }
        }

        let mut core = TaskCore::new(None);
        core.queue_entry_ids = entries.iter().map(|e| e.id).collect();
        core.host_ids = hosts.iter().map(|h| h.id).collect();

        Ok(Self {
            core,
            job,
            entries,
            hosts,
            hostless,
        })
    }

    pub fn is_hostless(&self) -> bool {
        self.hostless
    }

    fn keyval_path(&self) -> String {
        format!("{}/keyval", self.working_directory())
    }

    async fn write_status_comment(&mut self, ctx: &SchedulerContext, comment: &str) {
        let path = format!("{}/status.log", self.working_directory());
        let process = match self.core.monitor.as_mut() {
            Some(monitor) => monitor.get_process(ctx).await,
            None => None,
        };
        ctx.drone_manager
            .write_lines_to_file(&path, &[format!("INFO\t----\t----\t{comment}")], process.as_ref())
            .await;
    }

    async fn log_abort(&mut self, ctx: &SchedulerContext) {
        let keyval_path = self.keyval_path();
        let Some(monitor) = self.core.monitor.as_mut() else {
            return;
        };
        if !monitor.has_process(ctx).await {
            return;
        }

        let aborted_by = "autotest_system";
        let aborted_on = ctx.now();
        write_keyval_after_job(ctx, monitor, &keyval_path, "aborted_by", aborted_by).await;
        write_keyval_after_job(ctx, monitor, &keyval_path, "aborted_on", timestamp(aborted_on))
            .await;
        let comment = format!(
            "Job aborted by {aborted_by} on {}",
            aborted_on.format("%Y-%m-%d %H:%M:%S")
        );
        self.write_status_comment(ctx, &comment).await;
    }

    async fn finish_task(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let working_directory = self.working_directory();
        let keyval_path = self.keyval_path();
        if let Some(monitor) = self.core.monitor.as_mut() {
            write_keyval_after_job(ctx, monitor, &keyval_path, "job_finished", timestamp(ctx.now()))
                .await;
            if monitor.lost_process() {
                ctx.drone_manager
                    .write_lines_to_file(
                        &format!("{working_directory}/job_failure"),
                        &[LOST_PROCESS_ERROR.to_string()],
                        None,
                    )
                    .await;
            }
        }

        if self.hostless {
            return lifecycle::set_status(ctx, self.entries[0].id, HostQueueEntryStatus::Parsing)
                .await;
        }
        for (entry, host) in self.entries.iter().zip(&self.hosts) {
            lifecycle::set_status(ctx, entry.id, HostQueueEntryStatus::Gathering).await?;
            lifecycle::set_host_status(ctx, host.id, HostStatus::Running).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentTask for QueueTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        if self.hostless {
            "HostlessQueueTask"
        } else {
            "QueueTask"
        }
    }

    fn working_directory(&self) -> String {
        consistent_execution_tag(&self.job, &self.entries)
            .unwrap_or_else(|_| self.entries[0].execution_tag(&self.job))
    }

    fn owner_username(&self) -> Option<String> {
        Some(self.job.owner.clone())
    }

    fn num_processes(&self) -> usize {
        self.entries.len()
    }

    async fn command_line(&mut self, ctx: &SchedulerContext) -> SchedulerResult<Vec<String>> {
        let working_directory = consistent_execution_tag(&self.job, &self.entries)?;
        let control_path = ctx
            .drone_manager
            .attach_file_to_execution(&working_directory, &self.job.control_file, None)
            .await;
        let hostnames: Vec<String> = self.hosts.iter().map(|h| h.hostname.clone()).collect();
        let extra_args = vec![
            "-P".to_string(),
            working_directory.clone(),
            "-n".to_string(),
            ctx.drone_manager.absolute_path(&control_path),
        ];
        Ok(autoserv_command_line(
            ctx,
            &working_directory,
            &hostnames,
            &extra_args,
            Some(&self.job),
            false,
        ))
    }

    async fn prolog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if self.hostless {
            let entry = &mut self.entries[0];
            ctx.repos
                .entries
                .update_execution_subdir(entry.id, HOSTLESS_SUBDIR)
                .await?;
            entry.execution_subdir = HOSTLESS_SUBDIR.to_string();
        } else {
            check_entry_statuses(
                ctx,
                self.name(),
                &self.core.queue_entry_ids,
                &[HostQueueEntryStatus::Starting, HostQueueEntryStatus::Running],
                Some(&[HostStatus::Pending, HostStatus::Running]),
            )
            .await?;
        }

        let mut keyvals = vec![("job_queued", timestamp(self.job.created_on).to_string())];
        let group_name = lifecycle::get_group_name(ctx, &self.job, &self.entries[0]).await?;
        if !group_name.is_empty() {
            keyvals.push(("host_group_name", group_name));
        }
        let working_directory = self.working_directory();
        write_keyvals_before_job(ctx, &working_directory, &keyvals, &self.keyval_path()).await;

        for entry in &self.entries {
            lifecycle::set_status(ctx, entry.id, HostQueueEntryStatus::Running).await?;
            lifecycle::set_started_on_now(ctx, entry.id).await?;
        }

        if self.hostless {
            return Ok(());
        }
        for host in &self.hosts {
            write_host_keyvals(ctx, &working_directory, host).await?;
            lifecycle::set_host_status(ctx, host.id, HostStatus::Running).await?;
            ctx.repos.hosts.update_dirty(host.id, true).await?;
        }
        if self.job.synch_count == 1 && self.entries.len() == 1 {
            let machines_file = format!("{}/.machines", self.job.tag());
            ctx.drone_manager
                .write_lines_to_file(&machines_file, &[self.hosts[0].hostname.clone()], None)
                .await;
        }
        info!(
            "作业 {} 在 {} 个主机上启动",
            self.job.tag(),
            self.hosts.len()
        );
        Ok(())
    }

    async fn epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.cleanup(ctx).await?;
        self.finish_task(ctx).await
    }

    async fn abort(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.abort_process(ctx).await?;
        self.log_abort(ctx).await;
        self.finish_task(ctx).await
    }
}
