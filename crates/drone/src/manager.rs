use async_trait::async_trait;
use scheduler_core::SchedulerResult;

use crate::pidfile::{PidfileContents, PidfileId, Process};

/// 启动一个后台命令的请求
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: Vec<String>,
    /// 相对于结果目录的工作目录，pidfile写在这里
    pub working_directory: String,
    pub pidfile_name: String,
    /// 计入drone容量的进程数
    pub num_processes: usize,
    pub nice_level: Option<i32>,
    /// 相对于结果目录的日志文件，缺省时使用临时路径
    pub log_file: Option<String>,
    /// 与已运行的进程放在同一台drone上
    pub paired_with_pidfile: Option<PidfileId>,
    pub username: Option<String>,
}

impl RunRequest {
    pub fn new(
        command: Vec<String>,
        working_directory: impl Into<String>,
        pidfile_name: impl Into<String>,
    ) -> Self {
        Self {
            command,
            working_directory: working_directory.into(),
            pidfile_name: pidfile_name.into(),
            num_processes: 1,
            nice_level: None,
            log_file: None,
            paired_with_pidfile: None,
            username: None,
        }
    }
}

/// 执行机抽象
///
/// 除 `refresh` 外所有读取都基于最近一次刷新得到的快照；启动、终止、复制
/// 等写操作先排队，在 `execute_actions` 中统一执行。所有路径都相对于结果目录，
/// `absolute_path` 的返回值除外。
#[async_trait]
pub trait DroneManager: Send + Sync {
    /// tick开始时刷新进程表和所有已注册的pidfile
    async fn refresh(&self) -> SchedulerResult<()>;

    /// tick结束时执行所有排队的操作
    async fn execute_actions(&self) -> SchedulerResult<()>;

    async fn run(&self, request: RunRequest) -> SchedulerResult<PidfileId>;

    fn get_pidfile_id_from(&self, execution_tag: &str, pidfile_name: &str) -> PidfileId;

    async fn register_pidfile(&self, pidfile_id: &PidfileId);

    async fn unregister_pidfile(&self, pidfile_id: &PidfileId);

    async fn declare_process_count(&self, pidfile_id: &PidfileId, num_processes: usize);

    /// `use_second_read` 读取进程扫描之后的第二份快照
    async fn get_pidfile_contents(
        &self,
        pidfile_id: &PidfileId,
        use_second_read: bool,
    ) -> SchedulerResult<PidfileContents>;

    async fn is_process_running(&self, process: &Process) -> bool;

    async fn kill_process(&self, process: &Process);

    /// 当前还能启动的进程数
    async fn max_runnable_processes(&self) -> usize;

    async fn total_running_processes(&self) -> usize;

    /// 父进程为init的autoserv进程
    async fn get_orphaned_autoserv_processes(&self) -> Vec<Process>;

    async fn get_temporary_path(&self, base_name: &str) -> String;

    fn absolute_path(&self, path: &str) -> String;

    async fn copy_to_results_repository(
        &self,
        process: &Process,
        source_path: &str,
        destination_path: Option<&str>,
    );

    async fn copy_results_on_drone(
        &self,
        process: &Process,
        source_path: &str,
        destination_path: &str,
    );

    /// 进程启动前写入工作目录的文件，返回文件路径
    async fn attach_file_to_execution(
        &self,
        results_dir: &str,
        file_contents: &str,
        file_path: Option<&str>,
    ) -> String;

    /// 指定进程时写在该进程所在的drone上，否则写入结果仓库
    async fn write_lines_to_file(
        &self,
        file_path: &str,
        lines: &[String],
        paired_with_process: Option<&Process>,
    );
}
