use chrono::{DateTime, Duration, Utc};
use scheduler_core::SchedulerResult;
use scheduler_domain::{HostQueueEntryStatus, Job};
use tracing::{error, info, warn};

use crate::context::SchedulerContext;

const EVERYONE_ACL: &str = "Everyone";
const MAX_REPORTED_INCONSISTENCIES: usize = 50;

/// 周期清理：按作业超时和运行时限设置中止标记，清理禁用记录并检查数据一致性
///
/// 这里只设置中止标记，真正的中止在下一次tick的 `find_aborting` 中完成。
#[derive(Debug)]
pub struct PeriodicCleanup {
    last_clean_time: DateTime<Utc>,
    interval: Duration,
    run_at_initialize: bool,
}

impl PeriodicCleanup {
    pub fn new(ctx: &SchedulerContext) -> Self {
        Self {
            last_clean_time: ctx.now(),
            interval: ctx.config.clean_interval(),
            run_at_initialize: ctx.config.clean_on_startup,
        }
    }

    pub async fn initialize(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if self.run_at_initialize {
            self.run_cleanup(ctx).await?;
        }
        Ok(())
    }

    /// 距上次清理超过间隔时执行，返回是否执行了清理
    pub async fn run_cleanup_maybe(&mut self, ctx: &SchedulerContext) -> SchedulerResult<bool> {
        if self.last_clean_time + self.interval >= ctx.now() {
            return Ok(false);
        }
        self.run_cleanup(ctx).await?;
        self.last_clean_time = ctx.now();
        Ok(true)
    }

    pub async fn run_cleanup(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        info!("执行周期清理");
        let jobs = ctx.repos.jobs.find_with_incomplete_entries().await?;
        self.abort_timed_out_jobs(ctx, &jobs).await?;
        self.abort_jobs_past_synch_start_timeout(ctx, &jobs).await?;
        self.abort_jobs_past_max_runtime(ctx, &jobs).await?;
        self.clear_inactive_blocks(ctx).await?;
        self.check_for_db_inconsistencies(ctx).await
    }

    async fn abort_timed_out_jobs(&self, ctx: &SchedulerContext, jobs: &[Job]) -> SchedulerResult<()> {
        let now = ctx.now();
        for job in jobs {
            if job.created_on + Duration::hours(job.timeout_hrs.into()) < now {
                warn!("作业 {} 超时，中止", job.id);
                self.abort_entries(ctx, job, |_| true).await?;
            }
        }
        Ok(())
    }

    /// 长时间占着 Everyone 主机等待凑齐的同步作业
    async fn abort_jobs_past_synch_start_timeout(
        &self,
        ctx: &SchedulerContext,
        jobs: &[Job],
    ) -> SchedulerResult<()> {
        let Some(everyone) = ctx.repos.acls.find_by_name(EVERYONE_ACL).await? else {
            return Ok(());
        };
        let timeout_start = ctx.now() - ctx.config.synch_job_start_timeout();

        for job in jobs.iter().filter(|j| j.created_on < timeout_start) {
            let entries = ctx.repos.entries.find_by_job(job.id).await?;
            let holding_everyone_host = entries.iter().any(|e| {
                e.status == HostQueueEntryStatus::Pending
                    && e.host_id.map_or(false, |h| everyone.host_ids.contains(&h))
            });
            if holding_everyone_host {
                warn!("作业 {} 超过启动等待时间，中止", job.id);
                self.abort_entries(ctx, job, |status| status != HostQueueEntryStatus::Running)
                    .await?;
            }
        }
        Ok(())
    }

    async fn abort_jobs_past_max_runtime(
        &self,
        ctx: &SchedulerContext,
        jobs: &[Job],
    ) -> SchedulerResult<()> {
        let now = ctx.now();
        for job in jobs {
            let max_runtime = Duration::hours(job.max_runtime_hrs.into());
            for entry in ctx.repos.entries.find_by_job(job.id).await? {
                if entry.complete() || entry.aborted {
                    continue;
                }
                if let Some(started_on) = entry.started_on {
                    if started_on + max_runtime < now {
                        warn!("{} 超过最长运行时间，中止", entry.entry_description());
                        ctx.repos.entries.set_aborted(entry.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn abort_entries(
        &self,
        ctx: &SchedulerContext,
        job: &Job,
        filter: impl Fn(HostQueueEntryStatus) -> bool,
    ) -> SchedulerResult<()> {
        for entry in ctx.repos.entries.find_by_job(job.id).await? {
            if !entry.complete() && !entry.aborted && filter(entry.status) {
                ctx.repos.entries.set_aborted(entry.id).await?;
            }
        }
        Ok(())
    }

    async fn clear_inactive_blocks(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let removed = ctx.repos.ineligible_hosts.delete_inactive().await?;
        if removed > 0 {
            info!("清除 {} 条已完成作业的主机禁用记录", removed);
        }
        Ok(())
    }

    async fn check_for_db_inconsistencies(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let entries = ctx.repos.entries.find_inconsistent().await?;
        if entries.is_empty() {
            return Ok(());
        }
        let subject = format!("{} queue entries found with active=complete=1", entries.len());
        let mut message = entries
            .iter()
            .take(MAX_REPORTED_INCONSISTENCIES)
            .map(|e| e.entry_description())
            .collect::<Vec<_>>()
            .join("\n");
        if entries.len() > MAX_REPORTED_INCONSISTENCIES {
            message.push_str("\n(truncated)\n");
        }
        error!("{}", subject);
        ctx.email.enqueue_admin(&subject, &message);
        Ok(())
    }
}
