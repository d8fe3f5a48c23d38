//! 进程监视器
//!
//! 每个 Agent 任务通过 [`PidfileRunMonitor`] 跟踪它启动（或恢复）的进程。
//! 监视器只读取 drone 在本次tick开始时刷新的pidfile快照，判定进程是否仍在
//! 运行、退出码以及失败的测试数。写pidfile之前进程就消失时判定为“丢失”，
//! 丢失的进程按退出码1处理。

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;
use scheduler_drone::{PidfileContents, PidfileId, Process, RunRequest};
use tracing::{debug, warn};

use crate::context::SchedulerContext;
use crate::metrics;

#[derive(Debug, Default)]
pub struct PidfileRunMonitor {
    pidfile_id: Option<PidfileId>,
    start_time: Option<DateTime<Utc>>,
    state: PidfileContents,
    lost_process: bool,
}

impl PidfileRunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(
        &mut self,
        ctx: &SchedulerContext,
        request: RunRequest,
    ) -> SchedulerResult<()> {
        let pidfile_id = ctx.drone_manager.run(request).await?;
        self.start_time = Some(ctx.now());
        self.pidfile_id = Some(pidfile_id);
        Ok(())
    }

    /// 接管已经在运行的进程（启动恢复时使用）
    pub async fn attach_to_existing_process(
        &mut self,
        ctx: &SchedulerContext,
        execution_path: &str,
        pidfile_name: &str,
        num_processes: Option<usize>,
    ) {
        let pidfile_id = ctx
            .drone_manager
            .get_pidfile_id_from(execution_path, pidfile_name);
        if let Some(num_processes) = num_processes {
            ctx.drone_manager
                .declare_process_count(&pidfile_id, num_processes)
                .await;
        }
        self.start_time = Some(ctx.now());
        self.pidfile_id = Some(pidfile_id);
    }

    pub fn pidfile_id(&self) -> Option<&PidfileId> {
        self.pidfile_id.as_ref()
    }

    pub fn lost_process(&self) -> bool {
        self.lost_process
    }

    pub async fn kill(&mut self, ctx: &SchedulerContext) {
        if let Some(process) = self.get_process(ctx).await {
            ctx.drone_manager.kill_process(&process).await;
        }
    }

    pub async fn has_process(&mut self, ctx: &SchedulerContext) -> bool {
        self.refresh(ctx).await;
        self.state.process.is_some()
    }

    pub async fn get_process(&mut self, ctx: &SchedulerContext) -> Option<Process> {
        self.refresh(ctx).await;
        self.state.process.clone()
    }

    pub async fn exit_code(&mut self, ctx: &SchedulerContext) -> Option<i32> {
        self.refresh(ctx).await;
        self.state.exit_status
    }

    /// 失败的测试数，未知时返回 -1
    pub async fn num_tests_failed(&mut self, ctx: &SchedulerContext) -> i32 {
        self.refresh(ctx).await;
        self.state.num_tests_failed.unwrap_or(-1)
    }

    pub async fn try_copy_results_on_drone(
        &mut self,
        ctx: &SchedulerContext,
        source: &str,
        destination: &str,
    ) {
        match self.get_process(ctx).await {
            Some(process) => {
                ctx.drone_manager
                    .copy_results_on_drone(&process, source, destination)
                    .await
            }
            None => debug!("没有进程，跳过复制 {} -> {}", source, destination),
        }
    }

    pub async fn try_copy_to_results_repository(
        &mut self,
        ctx: &SchedulerContext,
        source: &str,
        destination: Option<&str>,
    ) {
        match self.get_process(ctx).await {
            Some(process) => {
                ctx.drone_manager
                    .copy_to_results_repository(&process, source, destination)
                    .await
            }
            None => debug!("没有进程，跳过复制 {}", source),
        }
    }

    async fn refresh(&mut self, ctx: &SchedulerContext) {
        if self.lost_process {
            return;
        }
        let Some(pidfile_id) = self.pidfile_id.clone() else {
            return;
        };

        if let Err(e) = self.read_pidfile(ctx, &pidfile_id, false).await {
            self.state = PidfileContents::default();
            self.handle_pidfile_error(ctx, &pidfile_id, "Pidfile error", &e.to_string());
        }
    }

    async fn read_pidfile(
        &mut self,
        ctx: &SchedulerContext,
        pidfile_id: &PidfileId,
        use_second_read: bool,
    ) -> SchedulerResult<()> {
        self.state = ctx
            .drone_manager
            .get_pidfile_contents(pidfile_id, use_second_read)
            .await?;

        let Some(process) = self.state.process.clone() else {
            self.handle_no_process(ctx, pidfile_id);
            return Ok(());
        };

        if self.state.exit_status.is_none() && !ctx.drone_manager.is_process_running(&process).await
        {
            // 进程可能在第一次读取之后才退出，再读一次进程扫描之后的快照
            self.state = ctx
                .drone_manager
                .get_pidfile_contents(pidfile_id, true)
                .await?;
            if self.state.exit_status.is_none() {
                self.handle_pidfile_error(
                    ctx,
                    pidfile_id,
                    "autoserv died without writing exit code",
                    "",
                );
            }
        }
        Ok(())
    }

    fn handle_no_process(&mut self, ctx: &SchedulerContext, pidfile_id: &PidfileId) {
        let Some(start_time) = self.start_time else {
            return;
        };
        if ctx.now() - start_time > ctx.config.pidfile_timeout() {
            let message = format!("No pid found at {pidfile_id}");
            ctx.email
                .enqueue_admin("Process has failed to write pidfile", &message);
            self.on_lost_process(pidfile_id, None);
        }
    }

    fn handle_pidfile_error(
        &mut self,
        ctx: &SchedulerContext,
        pidfile_id: &PidfileId,
        error: &str,
        message: &str,
    ) {
        let process = self
            .state
            .process
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "None".to_string());
        let body = format!("{error}\nProcess: {process}\nPidfile: {pidfile_id}\n{message}");
        ctx.email.enqueue_admin(error, &body);
        let process = self.state.process.clone();
        self.on_lost_process(pidfile_id, process);
    }

    fn on_lost_process(&mut self, pidfile_id: &PidfileId, process: Option<Process>) {
        warn!("进程丢失，按失败处理: pidfile={} process={:?}", pidfile_id, process);
        self.lost_process = true;
        self.state.process = process;
        self.state.exit_status = Some(1);
        self.state.num_tests_failed = Some(0);
        metrics::record_lost_process();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Repositories;
    use crate::notifications::EmailManager;
    use scheduler_core::{NotificationConfig, SchedulerConfig};
    use scheduler_drone::{DroneManager, AUTOSERV_PID_FILE};
    use scheduler_testing_utils::{
        FakeDroneManager, ManualClock, MockDatabase, RecordingNotificationSink,
    };
    use std::sync::Arc;

    fn context(drone: FakeDroneManager, clock: ManualClock) -> (SchedulerContext, RecordingNotificationSink) {
        let sink = RecordingNotificationSink::new();
        let clock = Arc::new(clock);
        let email = EmailManager::new(
            Arc::new(sink.clone()),
            NotificationConfig::default(),
            clock.clone(),
        );
        let config = SchedulerConfig {
            pidfile_timeout_mins: 1,
            ..Default::default()
        };
        let ctx = SchedulerContext::new(
            Repositories::from_shared(Arc::new(MockDatabase::new())),
            Arc::new(drone),
            email,
            clock,
            config,
        );
        (ctx, sink)
    }

    #[tokio::test]
    async fn test_exit_code_after_process_finishes() {
        let drone = FakeDroneManager::new();
        let (ctx, _) = context(drone.clone(), ManualClock::default());
        let mut monitor = PidfileRunMonitor::new();
        let request = RunRequest::new(vec!["autoserv".into()], "1-user/host1", AUTOSERV_PID_FILE);
        monitor.run(&ctx, request).await.unwrap();

        assert_eq!(monitor.exit_code(&ctx).await, None);
        drone.execute_actions().await.unwrap();
        assert!(monitor.has_process(&ctx).await);

        drone.set_pidfile_contents(
            "1-user/host1",
            AUTOSERV_PID_FILE,
            PidfileContents::finished(Process::new("drone1", 1001), 0, 2),
        );
        assert_eq!(monitor.exit_code(&ctx).await, Some(0));
        assert_eq!(monitor.num_tests_failed(&ctx).await, 2);
        assert!(!monitor.lost_process());
    }

    #[tokio::test]
    async fn test_process_gone_without_exit_code_is_lost() {
        let drone = FakeDroneManager::new();
        let (ctx, sink) = context(drone.clone(), ManualClock::default());
        let mut monitor = PidfileRunMonitor::new();
        let request = RunRequest::new(vec!["autoserv".into()], "1-user/host1", AUTOSERV_PID_FILE);
        monitor.run(&ctx, request).await.unwrap();
        drone.execute_actions().await.unwrap();
        assert_eq!(monitor.exit_code(&ctx).await, None);

        drone.mark_process_dead(Process::new("drone1", 1001));
        assert_eq!(monitor.exit_code(&ctx).await, Some(1));
        assert_eq!(monitor.num_tests_failed(&ctx).await, 0);
        assert!(monitor.lost_process());
        assert_eq!(
            monitor.get_process(&ctx).await,
            Some(Process::new("drone1", 1001))
        );

        ctx.email.send_queued().await.unwrap();
        let subjects = sink.subjects();
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].ends_with("autoserv died without writing exit code"));
        assert!(sink.sent()[0].body.contains("Process: drone1/1001"));
    }

    #[tokio::test]
    async fn test_missing_pidfile_times_out_as_lost() {
        let drone = FakeDroneManager::new();
        let clock = ManualClock::default();
        let (ctx, _) = context(drone, clock.clone());
        let mut monitor = PidfileRunMonitor::new();
        monitor
            .attach_to_existing_process(&ctx, "1-user/host1", AUTOSERV_PID_FILE, Some(1))
            .await;

        assert_eq!(monitor.exit_code(&ctx).await, None);
        assert!(!monitor.lost_process());

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(monitor.exit_code(&ctx).await, Some(1));
        assert!(monitor.lost_process());
        assert_eq!(monitor.num_tests_failed(&ctx).await, 0);
        assert_eq!(ctx.email.queued_count(), 1);

        ctx.email.send_queued().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_process_notifies_admin() {
        let drone = FakeDroneManager::new();
        let clock = ManualClock::default();
        let (ctx, sink) = context(drone, clock.clone());
        let mut monitor = PidfileRunMonitor::new();
        monitor
            .attach_to_existing_process(&ctx, "hosts/host1/1-verify", AUTOSERV_PID_FILE, None)
            .await;
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(monitor.exit_code(&ctx).await, Some(1));
        assert!(!monitor.has_process(&ctx).await);

        ctx.email.send_queued().await.unwrap();
        let subjects = sink.subjects();
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].ends_with("Process has failed to write pidfile"));
        assert!(sink.sent()[0].body.contains("hosts/host1/1-verify/.autoserv_execute"));
    }
}
