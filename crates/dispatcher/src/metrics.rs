//! 调度器指标
//!
//! 只通过 `metrics` facade 记录，是否导出由应用层安装的recorder决定。

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub const TICKS_TOTAL: &str = "lab_scheduler_ticks_total";
pub const AGENTS_STARTED_TOTAL: &str = "lab_scheduler_agents_started_total";
pub const AGENT_ERRORS_TOTAL: &str = "lab_scheduler_agent_errors_total";
pub const ACTIVE_AGENTS: &str = "lab_scheduler_active_agents";
pub const RUNNING_PROCESSES: &str = "lab_scheduler_running_processes";
pub const LOST_PROCESSES_TOTAL: &str = "lab_scheduler_lost_processes_total";
pub const TICK_DURATION_SECONDS: &str = "lab_scheduler_tick_duration_seconds";

pub fn record_tick(duration: Duration) {
    counter!(TICKS_TOTAL).increment(1);
    histogram!(TICK_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_agent_started(task_name: &'static str) {
    counter!(AGENTS_STARTED_TOTAL, "task" => task_name).increment(1);
}

pub fn record_agent_error(task_name: &'static str) {
    counter!(AGENT_ERRORS_TOTAL, "task" => task_name).increment(1);
}

pub fn record_lost_process() {
    counter!(LOST_PROCESSES_TOTAL).increment(1);
}

pub fn set_agent_gauges(active_agents: usize, running_processes: usize) {
    gauge!(ACTIVE_AGENTS).set(active_agents as f64);
    gauge!(RUNNING_PROCESSES).set(running_processes as f64);
}
