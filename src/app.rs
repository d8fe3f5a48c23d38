use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scheduler_core::{AppConfig, Clock, SystemClock};
use scheduler_dispatcher::{
    Dispatcher, EmailManager, LogNotificationSink, Repositories, SchedulerContext,
};
use scheduler_drone::LocalDroneManager;
use scheduler_infrastructure::DatabaseManager;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 单次运行的选项，来自命令行
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// 启动时接管上一次运行留下的进程和状态
    pub recover: bool,
    /// 只运行一次tick
    pub once: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            recover: true,
            once: false,
        }
    }
}

/// 主应用程序：组装仓储、drone和调度器，驱动tick循环
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    dispatcher: Dispatcher,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;

        let repos = Repositories {
            jobs: database.job_repository(),
            entries: database.queue_entry_repository(),
            hosts: database.host_repository(),
            labels: database.label_repository(),
            acls: database.acl_repository(),
            ineligible_hosts: database.ineligible_host_repository(),
            special_tasks: database.special_task_repository(),
        };

        let drone_manager = LocalDroneManager::new(&config.drones, &config.scheduler)
            .context("初始化drone管理器失败")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sink = Arc::new(LogNotificationSink::new(
            config.notifications.admin_address.clone(),
        ));
        let email = EmailManager::new(sink, config.notifications.clone(), clock.clone());

        let ctx = SchedulerContext::new(
            repos,
            Arc::new(drone_manager),
            email,
            clock,
            config.scheduler.clone(),
        );
        let dispatcher = Dispatcher::new(Arc::new(ctx));

        info!(
            "应用初始化完成：{} 个drone，结果目录 {}",
            config.drones.len(),
            config.scheduler.results_dir
        );
        Ok(Self {
            config,
            database,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// 运行调度循环直到收到关闭信号
    ///
    /// 非致命的tick错误只记录日志，致命错误（配置、恢复）终止循环。
    pub async fn run(
        &mut self,
        options: RunOptions,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        if options.recover {
            self.dispatcher
                .initialize()
                .await
                .context("启动恢复失败")?;
        } else {
            warn!("跳过启动恢复");
        }

        let pause = Duration::from_secs(self.config.scheduler.tick_pause_secs);
        loop {
            if let Err(e) = self.dispatcher.tick().await {
                if e.is_fatal() {
                    return Err(e).context("调度循环出现致命错误");
                }
                error!("tick失败: {}", e);
            }

            if options.once {
                info!("单次运行完成");
                break;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("调度循环收到关闭信号");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("调度循环已停止，共执行 {} 次tick", self.dispatcher.tick_count());
        self.database.close().await;
        Ok(())
    }
}
