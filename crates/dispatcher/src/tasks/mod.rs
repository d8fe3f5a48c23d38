//! Agent任务
//!
//! 每个任务对应drone上的一个进程（延迟调用任务除外）。任务的推进由
//! [`AgentTask::poll`] 驱动：第一次调用时执行 `prolog` 并启动进程，之后每次
//! tick读取退出码，进程结束后执行 `epilog` 推进条目与主机的状态。

mod delayed;
mod post_job;
mod queue;
mod special;

pub use delayed::DelayedCallTask;
pub use post_job::{PostJobKind, PostJobTask};
pub use queue::QueueTask;
pub use special::SpecialAgentTask;

use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{Host, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job};
use scheduler_drone::{PidfileId, RunRequest, AUTOSERV_PID_FILE};
use tracing::{info, warn};

use crate::context::SchedulerContext;
use crate::monitor::PidfileRunMonitor;

/// 所有任务共有的状态
#[derive(Debug, Default)]
pub struct TaskCore {
    pub started: bool,
    pub done: bool,
    pub success: bool,
    pub aborted: bool,
    pub monitor: Option<PidfileRunMonitor>,
    pub log_file_name: Option<&'static str>,
    pub host_ids: Vec<i64>,
    pub queue_entry_ids: Vec<i64>,
}

impl TaskCore {
    pub fn new(log_file_name: Option<&'static str>) -> Self {
        Self {
            log_file_name,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AgentTask: Send + Sync {
    fn core(&self) -> &TaskCore;

    fn core_mut(&mut self) -> &mut TaskCore;

    fn name(&self) -> &'static str;

    /// 进程的工作目录，相对于结果仓库
    fn working_directory(&self) -> String;

    async fn command_line(&mut self, ctx: &SchedulerContext) -> SchedulerResult<Vec<String>>;

    fn owner_username(&self) -> Option<String> {
        None
    }

    /// 计入drone容量的进程数，可以是近似值
    fn num_processes(&self) -> usize {
        1
    }

    fn pidfile_name(&self) -> &'static str {
        AUTOSERV_PID_FILE
    }

    /// 必须与之运行在同一台drone上的进程
    fn paired_monitor_mut(&mut self) -> Option<&mut PidfileRunMonitor> {
        None
    }

    fn paired_pidfile_id(&self) -> Option<PidfileId> {
        None
    }

    fn special_task_id(&self) -> Option<i64> {
        None
    }

    fn is_done(&self) -> bool {
        self.core().done
    }

    fn is_aborted(&self) -> bool {
        self.core().aborted
    }

    fn success(&self) -> bool {
        self.core().success
    }

    fn host_ids(&self) -> &[i64] {
        &self.core().host_ids
    }

    fn queue_entry_ids(&self) -> &[i64] {
        &self.core().queue_entry_ids
    }

    fn log_file(&self) -> Option<String> {
        self.core()
            .log_file_name
            .map(|name| format!("{}/{}", self.working_directory(), name))
    }

    async fn prolog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.register_necessary_pidfiles(ctx).await;
        Ok(())
    }

    async fn epilog(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.cleanup(ctx).await
    }

    async fn cleanup(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.copy_log_file(ctx).await;
        Ok(())
    }

    async fn poll(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.core().started {
            self.start(ctx).await?;
        }
        if !self.core().done {
            self.tick(ctx).await?;
        }
        Ok(())
    }

    async fn start(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.core().started {
            self.prolog(ctx).await?;
            self.run(ctx).await?;
        }
        self.core_mut().started = true;
        Ok(())
    }

    async fn tick(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.tick_monitor(ctx).await
    }

    async fn run(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.run_process(ctx).await
    }

    async fn finished(&mut self, ctx: &SchedulerContext, success: bool) -> SchedulerResult<()> {
        self.mark_finished(ctx, success).await
    }

    async fn abort(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        self.abort_process(ctx).await
    }

    async fn tick_monitor(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        let exit_code = match self.core_mut().monitor.as_mut() {
            Some(monitor) => monitor.exit_code(ctx).await,
            None => return Ok(()),
        };
        match exit_code {
            Some(code) => self.finished(ctx, code == 0).await,
            None => Ok(()),
        }
    }

    async fn mark_finished(&mut self, ctx: &SchedulerContext, success: bool) -> SchedulerResult<()> {
        if self.core().done {
            return Ok(());
        }
        let core = self.core_mut();
        core.started = true;
        core.done = true;
        core.success = success;
        self.epilog(ctx).await?;
        info!("{} 结束，success={}", self.name(), success);
        Ok(())
    }

    async fn abort_process(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if let Some(monitor) = self.core_mut().monitor.as_mut() {
            monitor.kill(ctx).await;
        }
        let core = self.core_mut();
        core.done = true;
        core.aborted = true;
        self.cleanup(ctx).await
    }

    /// 配对进程的结果不存在时任务直接失败
    async fn check_paired_results_exist(&mut self, ctx: &SchedulerContext) -> SchedulerResult<bool> {
        let name = self.name();
        let missing = match self.paired_monitor_mut() {
            Some(paired) => {
                if paired.has_process(ctx).await {
                    None
                } else {
                    Some(
                        paired
                            .pidfile_id()
                            .map(|id| id.to_string())
                            .unwrap_or_default(),
                    )
                }
            }
            None => None,
        };
        let Some(pidfile_id) = missing else {
            return Ok(true);
        };

        let subject = "No paired results in task";
        ctx.email
            .enqueue_admin(subject, &format!("{subject} {name} at {pidfile_id}"));
        self.finished(ctx, false).await?;
        Ok(false)
    }

    async fn run_process(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.check_paired_results_exist(ctx).await? {
            return Ok(());
        }

        let command = self.command_line(ctx).await?;
        let mut request =
            RunRequest::new(command, self.working_directory(), self.pidfile_name());
        request.num_processes = self.num_processes();
        request.nice_level = (ctx.config.nice_level != 0).then_some(ctx.config.nice_level);
        request.log_file = self.log_file();
        request.paired_with_pidfile = self.paired_pidfile_id();
        request.username = self.owner_username();

        let mut monitor = PidfileRunMonitor::new();
        monitor.run(ctx, request).await?;
        self.core_mut().monitor = Some(monitor);
        Ok(())
    }

    /// 启动恢复：接管上一次运行留下的进程，没有进程时等待正常启动
    async fn recover(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        if !self.check_paired_results_exist(ctx).await? {
            return Ok(());
        }

        let working_directory = self.working_directory();
        let mut monitor = PidfileRunMonitor::new();
        monitor
            .attach_to_existing_process(
                ctx,
                &working_directory,
                self.pidfile_name(),
                Some(self.num_processes()),
            )
            .await;
        let Some(process) = monitor.get_process(ctx).await else {
            return Ok(());
        };

        info!(
            "恢复进程 {} ({} at {})",
            process,
            self.name(),
            working_directory
        );
        let core = self.core_mut();
        core.monitor = Some(monitor);
        core.started = true;
        Ok(())
    }

    async fn register_necessary_pidfiles(&self, ctx: &SchedulerContext) {
        let pidfile_id = ctx
            .drone_manager
            .get_pidfile_id_from(&self.working_directory(), self.pidfile_name());
        ctx.drone_manager.register_pidfile(&pidfile_id).await;
        if let Some(paired) = self.paired_pidfile_id() {
            ctx.drone_manager.register_pidfile(&paired).await;
        }
    }

    async fn copy_log_file(&mut self, ctx: &SchedulerContext) {
        let Some(log_file) = self.log_file() else {
            return;
        };
        if let Some(monitor) = self.core_mut().monitor.as_mut() {
            monitor
                .try_copy_to_results_repository(ctx, &log_file, None)
                .await;
        }
    }

    /// 把整个工作目录复制回结果仓库
    async fn copy_results(&mut self, ctx: &SchedulerContext) {
        let results_path = format!("{}/", self.working_directory());
        if let Some(monitor) = self.core_mut().monitor.as_mut() {
            if monitor.has_process(ctx).await {
                monitor
                    .try_copy_to_results_repository(ctx, &results_path, None)
                    .await;
            }
        }
    }
}

/// Agent持有的任务，四种实现共用 [`AgentTask`] 的状态机
pub enum Task {
    Special(SpecialAgentTask),
    Queue(QueueTask),
    PostJob(PostJobTask),
    DelayedCall(DelayedCallTask),
}

impl Task {
    pub fn as_agent_task(&self) -> &dyn AgentTask {
        match self {
            Task::Special(task) => task,
            Task::Queue(task) => task,
            Task::PostJob(task) => task,
            Task::DelayedCall(task) => task,
        }
    }

    pub fn as_agent_task_mut(&mut self) -> &mut dyn AgentTask {
        match self {
            Task::Special(task) => task,
            Task::Queue(task) => task,
            Task::PostJob(task) => task,
            Task::DelayedCall(task) => task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.as_agent_task().name()
    }

    pub async fn recover(&mut self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        match self {
            Task::PostJob(task) => {
                task.recover(ctx).await?;
                task.count_recovered_process(ctx);
                Ok(())
            }
            // 延迟调用不对应任何进程
            Task::DelayedCall(_) => Ok(()),
            Task::Special(task) => task.recover(ctx).await,
            Task::Queue(task) => task.recover(ctx).await,
        }
    }
}

impl From<SpecialAgentTask> for Task {
    fn from(task: SpecialAgentTask) -> Self {
        Task::Special(task)
    }
}

impl From<QueueTask> for Task {
    fn from(task: QueueTask) -> Self {
        Task::Queue(task)
    }
}

impl From<PostJobTask> for Task {
    fn from(task: PostJobTask) -> Self {
        Task::PostJob(task)
    }
}

impl From<DelayedCallTask> for Task {
    fn from(task: DelayedCallTask) -> Self {
        Task::DelayedCall(task)
    }
}

/// autoserv命令行的公共部分
pub(crate) fn autoserv_command_line(
    ctx: &SchedulerContext,
    working_directory: &str,
    machines: &[String],
    extra_args: &[String],
    job: Option<&Job>,
    verbose: bool,
) -> Vec<String> {
    let mut command = vec![
        ctx.config.autoserv_path.clone(),
        "-p".to_string(),
        "-r".to_string(),
        ctx.drone_manager.absolute_path(working_directory),
    ];
    if !machines.is_empty() {
        command.push("-m".to_string());
        command.push(machines.join(","));
    }
    if let Some(job) = job {
        command.extend([
            "-u".to_string(),
            job.owner.clone(),
            "-l".to_string(),
            job.name.clone(),
        ]);
    }
    if verbose {
        command.push("--verbose".to_string());
    }
    command.extend(extra_args.iter().cloned());
    command
}

/// 条目状态不符合任务要求时拒绝启动
pub(crate) async fn check_entry_statuses(
    ctx: &SchedulerContext,
    task_name: &str,
    entry_ids: &[i64],
    allowed: &[HostQueueEntryStatus],
    allowed_host: Option<&[HostStatus]>,
) -> SchedulerResult<()> {
    for entry_id in entry_ids {
        let entry = ctx.entry(*entry_id).await?;
        if !allowed.contains(&entry.status) {
            return Err(scheduler_core::SchedulerError::invalid_state(format!(
                "{task_name} 试图启动状态无效的条目 {}",
                entry.entry_description()
            )));
        }
        if let Some(allowed_host) = allowed_host {
            let host = ctx.host_of(&entry).await?;
            if !allowed_host.contains(&host.status) {
                return Err(scheduler_core::SchedulerError::invalid_state(format!(
                    "{task_name} 试图在状态无效的主机 {} ({}) 上启动 {}",
                    host.hostname,
                    host.status,
                    entry.entry_description()
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn format_keyval(key: &str, value: impl std::fmt::Display) -> String {
    format!("{key}={value}")
}

/// 进程启动前附加到工作目录的keyval文件
pub(crate) async fn write_keyvals_before_job(
    ctx: &SchedulerContext,
    working_directory: &str,
    keyvals: &[(&str, String)],
    keyval_path: &str,
) {
    let mut contents = keyvals
        .iter()
        .map(|(key, value)| format_keyval(key, value))
        .collect::<Vec<_>>()
        .join("\n");
    // 以换行结尾，之后可以继续追加
    contents.push('\n');
    ctx.drone_manager
        .attach_file_to_execution(working_directory, &contents, Some(keyval_path))
        .await;
}

/// 进程结束后向结果目录追加一行keyval，写在进程所在的drone上
pub(crate) async fn write_keyval_after_job(
    ctx: &SchedulerContext,
    monitor: &mut PidfileRunMonitor,
    keyval_path: &str,
    key: &str,
    value: impl std::fmt::Display,
) {
    let Some(process) = monitor.get_process(ctx).await else {
        return;
    };
    ctx.drone_manager
        .write_lines_to_file(keyval_path, &[format_keyval(key, value)], Some(&process))
        .await;
}

/// `host_keyvals/<hostname>`：平台和所有标签
pub(crate) async fn write_host_keyvals(
    ctx: &SchedulerContext,
    working_directory: &str,
    host: &Host,
) -> SchedulerResult<()> {
    let labels = ctx.repos.labels.find_labels_for_host(host.id).await?;
    let platform = labels
        .iter()
        .find(|l| l.platform)
        .map(|l| l.name.clone())
        .unwrap_or_default();
    let all_labels = labels
        .iter()
        .map(|l| quote_label(&l.name))
        .collect::<Vec<_>>()
        .join(",");

    let keyval_path = format!("{working_directory}/host_keyvals/{}", host.hostname);
    write_keyvals_before_job(
        ctx,
        working_directory,
        &[("platform", platform), ("labels", all_labels)],
        &keyval_path,
    )
    .await;
    Ok(())
}

/// URL风格转义，保留字母数字和 `_.-/`
fn quote_label(label: &str) -> String {
    let mut quoted = String::with_capacity(label.len());
    for byte in label.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-' | b'/') {
            quoted.push(byte as char);
        } else {
            quoted.push_str(&format!("%{byte:02X}"));
        }
    }
    quoted
}

/// 所有条目必须共享同一个执行目录
pub(crate) fn consistent_execution_tag(
    job: &Job,
    entries: &[HostQueueEntry],
) -> SchedulerResult<String> {
    let first = entries.first().ok_or_else(|| {
        scheduler_core::SchedulerError::invalid_state(format!("作业 {} 的任务没有条目", job.id))
    })?;
    let tag = first.execution_tag(job);
    if let Some(other) = entries.iter().find(|e| e.execution_tag(job) != tag) {
        warn!("执行目录不一致: {} != {}", other.execution_tag(job), tag);
        return Err(scheduler_core::SchedulerError::invalid_state(format!(
            "{} ({}) 与 {} ({}) 的执行目录不一致",
            other.execution_tag(job),
            other.entry_description(),
            tag,
            first.entry_description()
        )));
    }
    Ok(tag)
}

pub(crate) fn timestamp(time: chrono::DateTime<chrono::Utc>) -> i64 {
    time.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_label() {
        assert_eq!(quote_label("x86_64"), "x86_64");
        assert_eq!(quote_label("rack a/1"), "rack%20a/1");
        assert_eq!(quote_label("a,b=c"), "a%2Cb%3Dc");
    }

    #[test]
    fn test_format_keyval() {
        assert_eq!(format_keyval("job_queued", 1704067200), "job_queued=1704067200");
    }
}
