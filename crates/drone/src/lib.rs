//! 执行机（drone）层
//!
//! 调度核心只通过 [`DroneManager`] 与执行机交互：启动进程、读取pidfile、
//! 终止进程和复制结果。

pub mod local;
pub mod manager;
pub mod pidfile;
pub mod procfs;

pub use local::LocalDroneManager;
pub use manager::{DroneManager, RunRequest};
pub use pidfile::{
    exit_was_signaled, parse_pidfile, PidfileContents, PidfileId, Process, ALL_PIDFILE_NAMES,
    ARCHIVER_PID_FILE, AUTOSERV_PID_FILE, CRASHINFO_PID_FILE, PARSER_PID_FILE,
};
