use std::sync::Arc;

use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::HostQueueEntryStatus;
use tracing::info;

use super::{AgentTask, TaskCore};
use crate::context::{DelayHandle, SchedulerContext};
use crate::lifecycle;

/// 不启动进程，到期后检查原子组作业能否开始运行
pub struct DelayedCallTask {
    core: TaskCore,
    job_id: i64,
    entry_id: i64,
    handle: Arc<DelayHandle>,
}

impl DelayedCallTask {
    pub fn new(job_id: i64, entry_id: i64, handle: Arc<DelayHandle>) -> Self {
        Self {
            core: TaskCore::new(None),
            job_id,
            entry_id,
            handle,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// 等待结束：主机仍不足则中止作业，否则立即运行
    async fn callback(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let job = ctx.job(self.job_id).await?;
        let entry = ctx.entry(self.entry_id).await?;
        if entry.status != HostQueueEntryStatus::Pending {
            return Ok(());
        }
        let pending = ctx
            .repos
            .entries
            .find_by_job(job.id)
            .await?
            .iter()
            .filter(|e| e.status == HostQueueEntryStatus::Pending)
            .count();
        if pending < job.synch_count.max(0) as usize {
            info!(
                "作业 {} 等待超时，只有 {} 个主机就绪，中止",
                job.id, pending
            );
            return lifecycle::request_abort(ctx, job.id).await;
        }
        lifecycle::run_job(ctx, &job, self.entry_id).await
    }
}

#[async_trait]
impl AgentTask for DelayedCallTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "DelayedCallTask"
    }

    fn working_directory(&self) -> String {
        String::new()
    }

    async fn command_line(&mut self, _ctx: &SchedulerContext) -> SchedulerResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn num_processes(&self) -> usize {
        0
    }

    fn is_done(&self) -> bool {
        self.core.done || self.handle.is_aborted()
    }

    async fn poll(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if self.is_done() {
            return Ok(());
        }
        self.core.started = true;
        if ctx.now() < self.handle.end_time {
            return Ok(());
        }
        self.core.success = true;
        self.core.done = true;
        ctx.remove_delay_handle(self.job_id);
        self.callback(ctx).await
    }

    async fn abort(&mut self, _ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.handle.abort();
        self.core.done = true;
        self.core.aborted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_aborted_handle_finishes_task() {
        let end_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let handle = Arc::new(DelayHandle::new(end_time));
        let task = DelayedCallTask::new(7, 70, handle.clone());
        assert!(!task.is_done());
        assert_eq!(task.num_processes(), 0);

        handle.abort();
        assert!(task.is_done());
        assert!(!task.is_aborted());
    }
}
