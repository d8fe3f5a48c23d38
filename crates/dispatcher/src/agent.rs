use scheduler_core::SchedulerResult;
use tracing::debug;

use crate::context::SchedulerContext;
use crate::tasks::Task;

/// 调度器驱动的最小单元，包装一个任务并记录它占用的主机和条目
pub struct Agent {
    id: u64,
    task: Task,
    queue_entry_ids: Vec<i64>,
    host_ids: Vec<i64>,
    started: bool,
    finished: bool,
}

impl Agent {
    pub fn new(id: u64, task: Task) -> Self {
        let queue_entry_ids = task.as_agent_task().queue_entry_ids().to_vec();
        let host_ids = task.as_agent_task().host_ids().to_vec();
        Self {
            id,
            task,
            queue_entry_ids,
            host_ids,
            started: false,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    pub fn name(&self) -> &'static str {
        self.task.name()
    }

    pub fn queue_entry_ids(&self) -> &[i64] {
        &self.queue_entry_ids
    }

    pub fn host_ids(&self) -> &[i64] {
        &self.host_ids
    }

    pub fn num_processes(&self) -> usize {
        self.task.as_agent_task().num_processes()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_done(&self) -> bool {
        self.finished
    }

    /// 恢复的任务已经有进程在运行
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub async fn tick(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.started = true;
        if self.finished {
            return Ok(());
        }
        let task = self.task.as_agent_task_mut();
        task.poll(ctx).await?;
        if task.is_done() {
            self.finished = true;
        }
        Ok(())
    }

    /// 任务可以忽略中止（后处理任务），此时Agent继续运行
    pub async fn abort(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let task = self.task.as_agent_task_mut();
        task.abort(ctx).await?;
        if task.is_aborted() || task.is_done() {
            debug!("Agent {} ({}) 已中止", self.id, task.name());
            self.finished = true;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("task", &self.name())
            .field("queue_entry_ids", &self.queue_entry_ids)
            .field("host_ids", &self.host_ids)
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish()
    }
}
