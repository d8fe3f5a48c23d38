//! pidfile协议
//!
//! 远程进程把自己的pid、退出码和失败测试数写入工作目录下的pidfile，
//! 这是调度器了解进程状态的唯一通道：
//!
//! ```text
//! <pid>            # 进程已启动
//! <exit_status>    # 进程结束后写入
//! <num_failed>     # 与退出码一起写入
//! ```

use scheduler_core::{SchedulerError, SchedulerResult};
use std::fmt;
use std::hash::{Hash, Hasher};

pub const AUTOSERV_PID_FILE: &str = ".autoserv_execute";
pub const CRASHINFO_PID_FILE: &str = ".collect_crashinfo_execute";
pub const PARSER_PID_FILE: &str = ".parser_execute";
pub const ARCHIVER_PID_FILE: &str = ".archiver_execute";

pub const ALL_PIDFILE_NAMES: [&str; 4] = [
    AUTOSERV_PID_FILE,
    CRASHINFO_PID_FILE,
    PARSER_PID_FILE,
    ARCHIVER_PID_FILE,
];

/// drone上的一个进程，以 (hostname, pid) 作为身份
#[derive(Debug, Clone)]
pub struct Process {
    pub hostname: String,
    pub pid: u32,
    pub ppid: Option<u32>,
}

impl Process {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            ppid: None,
        }
    }

    pub fn with_ppid(mut self, ppid: u32) -> Self {
        self.ppid = Some(ppid);
        self
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.pid == other.pid
    }
}

impl Eq for Process {}

impl Hash for Process {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
        self.pid.hash(state);
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.pid)
    }
}

/// pidfile句柄，对调度核心不透明
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PidfileId(String);

impl PidfileId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PidfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidfileContents {
    pub process: Option<Process>,
    pub exit_status: Option<i32>,
    pub num_tests_failed: Option<i32>,
}

impl PidfileContents {
    pub fn running(process: Process) -> Self {
        Self {
            process: Some(process),
            exit_status: None,
            num_tests_failed: None,
        }
    }

    pub fn finished(process: Process, exit_status: i32, num_tests_failed: i32) -> Self {
        Self {
            process: Some(process),
            exit_status: Some(exit_status),
            num_tests_failed: Some(num_tests_failed),
        }
    }

    /// 尚未运行：pidfile不存在或为空
    pub fn is_not_started(&self) -> bool {
        self.process.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some() && self.exit_status.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.exit_status.is_some()
    }
}

fn parse_int<T: std::str::FromStr>(path: &str, line: &str, what: &str) -> SchedulerResult<T> {
    line.trim()
        .parse::<T>()
        .map_err(|_| SchedulerError::InvalidPidfile {
            path: path.to_string(),
            message: format!("无法解析{what}: {line:?}"),
        })
}

/// 解析pidfile内容
///
/// 空内容表示进程尚未启动。只有两行时认为读取发生在进程写入退出码与
/// 失败数之间，按仍在运行处理，等待下一次刷新。
pub fn parse_pidfile(
    path: &str,
    drone_hostname: &str,
    raw_contents: &str,
) -> SchedulerResult<PidfileContents> {
    let lines: Vec<&str> = raw_contents.lines().collect();
    if lines.is_empty() {
        return Ok(PidfileContents::default());
    }
    if lines.len() > 3 {
        return Err(SchedulerError::InvalidPidfile {
            path: path.to_string(),
            message: format!("pidfile已损坏（{}行）", lines.len()),
        });
    }

    let (hostname, pid_text) = match lines[0].split_once(':') {
        Some((host, pid)) => (host.trim(), pid),
        None => (drone_hostname, lines[0]),
    };
    let pid: u32 = parse_int(path, pid_text, "pid")?;
    let process = Process::new(hostname, pid);

    if lines.len() == 3 {
        let exit_status: i32 = parse_int(path, lines[1], "退出码")?;
        let num_tests_failed: i32 = parse_int(path, lines[2], "失败测试数")?;
        return Ok(PidfileContents::finished(process, exit_status, num_tests_failed));
    }

    Ok(PidfileContents::running(process))
}

/// 判断退出码是否表示进程被信号终止（与 `os.WIFSIGNALED` 语义一致）
pub fn exit_was_signaled(exit_status: i32) -> bool {
    let signal = exit_status & 0x7f;
    signal != 0 && signal != 0x7f
}
