//! 通过 /proc 读取进程表，通过信号终止进程

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use scheduler_core::{SchedulerError, SchedulerResult};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub comm: String,
}

/// /proc/<pid>/stat 中的comm最多保留15个字符
pub fn comm_name(command_path: &str) -> String {
    let base = command_path.rsplit('/').next().unwrap_or(command_path);
    base.chars().take(15).collect()
}

pub fn parse_proc_stat(pid: u32, stat: &str) -> Option<ProcessInfo> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = stat[open + 1..close].to_string();
    let mut fields = stat[close + 1..].split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some(ProcessInfo {
        pid,
        ppid,
        pgid,
        comm,
    })
}

pub async fn read_process(pid: u32) -> Option<ProcessInfo> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    parse_proc_stat(pid, &stat)
}

/// 列出comm属于给定名称集合的进程
pub async fn scan_processes(command_names: &[String]) -> Vec<ProcessInfo> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir("/proc").await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("无法读取进程表: {}", e);
            return found;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(info) = read_process(pid).await {
            if command_names.iter().any(|name| *name == info.comm) {
                found.push(info);
            }
        }
    }
    found
}

/// 向进程发送SIGTERM
///
/// pid 0 或超出 `pid_t` 范围的值会被 kill(2) 解释为进程组，直接拒绝。
pub fn terminate(pid: u32) -> SchedulerResult<()> {
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| SchedulerError::drone_error(format!("无效的pid: {pid}")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|errno| SchedulerError::drone_error(format!("终止进程 {pid} 失败: {errno}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let stat = "4242 (autoserv) S 1 4242 4242 0 -1 4194560 1234 0 0 0";
        let info = parse_proc_stat(4242, stat).unwrap();
        assert_eq!(info.comm, "autoserv");
        assert_eq!(info.ppid, 1);
        assert_eq!(info.pgid, 4242);
    }

    #[test]
    fn test_parse_proc_stat_comm_with_spaces() {
        let stat = "17 (my (odd) proc) R 5 17 17 0";
        let info = parse_proc_stat(17, stat).unwrap();
        assert_eq!(info.comm, "my (odd) proc");
        assert_eq!(info.ppid, 5);
    }

    #[test]
    fn test_comm_name_truncates() {
        assert_eq!(comm_name("/usr/local/autotest/server/autoserv"), "autoserv");
        assert_eq!(comm_name("a_very_long_command_name"), "a_very_long_com");
    }

    #[tokio::test]
    async fn test_read_own_process() {
        let info = read_process(std::process::id()).await;
        if std::path::Path::new("/proc").exists() {
            assert!(info.is_some());
        }
    }

    #[test]
    fn test_terminate_rejects_process_group_pids() {
        assert!(terminate(0).is_err());
        assert!(terminate(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_terminate_running_child() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        terminate(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }
}
