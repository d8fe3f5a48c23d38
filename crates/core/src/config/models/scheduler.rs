use serde::{Deserialize, Serialize};

/// 调度主循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 两次tick之间的休眠时间（秒）
    pub tick_pause_secs: u64,
    /// 每个drone允许同时运行的进程数上限
    pub max_processes_per_drone: usize,
    /// 单次tick中最多启动的新进程数
    pub max_processes_started_per_cycle: usize,
    /// 全局同时运行的解析进程数上限
    pub max_parse_processes: usize,
    /// 全局同时运行的结果归档进程数上限
    pub max_transfer_processes: usize,
    /// 周期清理间隔（分钟）
    pub clean_interval_minutes: u64,
    /// 同步作业等待凑齐主机的超时时间（分钟）
    pub synch_job_start_timeout_minutes: u64,
    /// 原子组作业等待更多主机就绪的时间（秒），0表示不等待
    pub secs_to_wait_for_atomic_group_hosts: u64,
    /// 进程迟迟不写pidfile或进程丢失后判定为丢失的超时时间（分钟）
    pub pidfile_timeout_mins: u64,
    /// 已注册但长期未被引用的pidfile在多少次刷新后被丢弃
    pub max_pidfile_refreshes: u32,
    /// 启动恢复时是否重新校验处于 "Repair Failed" 状态的主机
    pub reverify_repair_failed_hosts: bool,
    /// 发现孤儿autoserv进程时是否终止启动
    pub die_on_orphans: bool,
    /// 解析完成后是否执行结果归档
    pub archive_results: bool,
    /// 启动时立即执行一次周期清理
    pub clean_on_startup: bool,
    /// 远程命令的nice级别
    pub nice_level: i32,
    /// 结果仓库根目录
    pub results_dir: String,
    pub autoserv_path: String,
    pub parser_path: String,
    pub archive_control_path: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_pause_secs: 5,
            max_processes_per_drone: 1000,
            max_processes_started_per_cycle: 100,
            max_parse_processes: 5,
            max_transfer_processes: 50,
            clean_interval_minutes: 60,
            synch_job_start_timeout_minutes: 240,
            secs_to_wait_for_atomic_group_hosts: 600,
            pidfile_timeout_mins: 300,
            max_pidfile_refreshes: 2000,
            reverify_repair_failed_hosts: true,
            die_on_orphans: false,
            archive_results: true,
            clean_on_startup: false,
            nice_level: 10,
            results_dir: "results".to_string(),
            autoserv_path: "autoserv".to_string(),
            parser_path: "parser".to_string(),
            archive_control_path: "scheduler/archive_results.control.srv".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_processes_per_drone == 0 {
            return Err(anyhow::anyhow!("每个drone的最大进程数必须大于0"));
        }

        if self.max_processes_started_per_cycle == 0 {
            return Err(anyhow::anyhow!("单次tick启动进程数上限必须大于0"));
        }

        if self.max_parse_processes == 0 {
            return Err(anyhow::anyhow!("解析进程数上限必须大于0"));
        }

        if self.max_transfer_processes == 0 {
            return Err(anyhow::anyhow!("归档进程数上限必须大于0"));
        }

        if self.clean_interval_minutes == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }

        if self.pidfile_timeout_mins == 0 {
            return Err(anyhow::anyhow!("pidfile超时时间必须大于0"));
        }

        if !(-20..=19).contains(&self.nice_level) {
            return Err(anyhow::anyhow!("nice级别必须在-20到19之间: {}", self.nice_level));
        }

        if self.results_dir.is_empty() {
            return Err(anyhow::anyhow!("结果目录不能为空"));
        }

        if self.autoserv_path.is_empty() || self.parser_path.is_empty() {
            return Err(anyhow::anyhow!("autoserv和parser路径不能为空"));
        }

        Ok(())
    }

    pub fn pidfile_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.pidfile_timeout_mins as i64)
    }

    pub fn clean_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.clean_interval_minutes as i64)
    }

    pub fn synch_job_start_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.synch_job_start_timeout_minutes as i64)
    }

    pub fn atomic_group_wait(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secs_to_wait_for_atomic_group_hosts as i64)
    }
}
