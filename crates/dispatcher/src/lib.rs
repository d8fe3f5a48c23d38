//! 调度核心
//!
//! [`Dispatcher`] 是单任务协作式主循环：每个tick刷新drone、
//! 为新作业分配主机、驱动所有 [`Agent`]、处理中止请求，最后统一执行drone上排队的操作。
//! 远程进程从不被同步等待，所有状态都通过pidfile和数据库推进。

pub mod agent;
pub mod cleanup;
pub mod context;
pub mod dispatcher;
pub mod host_scheduler;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod notifications;
pub mod tasks;

pub use agent::Agent;
pub use cleanup::PeriodicCleanup;
pub use context::{DelayHandle, Repositories, SchedulerContext, ThrottleKind};
pub use dispatcher::Dispatcher;
pub use host_scheduler::{order_pending_entries, AtomicPlacement, HostScheduler};
pub use monitor::PidfileRunMonitor;
pub use notifications::{EmailManager, LogNotificationSink};
pub use tasks::{
    AgentTask, DelayedCallTask, PostJobKind, PostJobTask, QueueTask, SpecialAgentTask, Task,
};
