//! 本机drone实现
//!
//! 所有配置的drone都在本机执行进程，各自只是一份独立的容量配额。
//! 进程通过 `tokio::process` 启动，状态通过pidfile和 /proc 获得。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{DroneConfig, SchedulerConfig, SchedulerError, SchedulerResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::manager::{DroneManager, RunRequest};
use crate::pidfile::{parse_pidfile, PidfileContents, PidfileId, Process};
use crate::procfs;

const TEMPORARY_DIRECTORY: &str = "drone_tmp";

#[derive(Debug, Clone)]
struct Drone {
    hostname: String,
    max_processes: usize,
    enabled: bool,
    active_processes: usize,
}

impl Drone {
    /// (已用比例, -max_processes)，越小越空闲
    fn used_capacity(&self) -> (f64, i64) {
        let ratio = if self.max_processes == 0 {
            1.0
        } else {
            self.active_processes as f64 / self.max_processes as f64
        };
        (ratio, -(self.max_processes as i64))
    }
}

#[derive(Debug, Default, Clone)]
struct PidfileInfo {
    age: u32,
    num_processes: Option<usize>,
    drone: Option<String>,
}

type PidfileReading = Result<PidfileContents, String>;

#[derive(Debug)]
enum DroneCall {
    Execute {
        command: Vec<String>,
        working_directory: PathBuf,
        log_file: PathBuf,
        pidfile_name: String,
    },
    Kill(Process),
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },
    WriteFile {
        path: PathBuf,
        contents: String,
    },
}

#[derive(Debug, Default)]
struct DroneState {
    drones: Vec<Drone>,
    registered: HashMap<PidfileId, PidfileInfo>,
    pidfiles: HashMap<PidfileId, PidfileReading>,
    pidfiles_second_read: HashMap<PidfileId, PidfileReading>,
    processes: HashSet<Process>,
    orphans: Vec<Process>,
    queued_calls: Vec<DroneCall>,
    attached_files: HashMap<String, Vec<(String, String)>>,
    temporary_path_counter: u64,
}

/// 本机DroneManager
pub struct LocalDroneManager {
    results_dir: PathBuf,
    process_names: Vec<String>,
    autoserv_name: String,
    max_pidfile_refreshes: u32,
    state: Mutex<DroneState>,
}

impl LocalDroneManager {
    pub fn new(drones: &[DroneConfig], config: &SchedulerConfig) -> SchedulerResult<Self> {
        if drones.is_empty() {
            return Err(SchedulerError::drone_error("没有可用的drone"));
        }

        let results_dir = PathBuf::from(&config.results_dir);
        let results_dir = if results_dir.is_absolute() {
            results_dir
        } else {
            std::env::current_dir()?.join(results_dir)
        };

        let drones = drones
            .iter()
            .map(|d| {
                info!("添加drone: {} (max_processes={})", d.hostname, d.max_processes);
                Drone {
                    hostname: d.hostname.clone(),
                    max_processes: d.max_processes.min(config.max_processes_per_drone),
                    enabled: d.enabled,
                    active_processes: 0,
                }
            })
            .collect();

        let autoserv_name = procfs::comm_name(&config.autoserv_path);
        let process_names = vec![autoserv_name.clone(), procfs::comm_name(&config.parser_path)];

        Ok(Self {
            results_dir,
            process_names,
            autoserv_name,
            max_pidfile_refreshes: config.max_pidfile_refreshes,
            state: Mutex::new(DroneState {
                drones,
                ..Default::default()
            }),
        })
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.results_dir.join(path)
    }

    async fn read_pidfiles(
        &self,
        pidfiles: &[(PidfileId, String)],
    ) -> HashMap<PidfileId, PidfileReading> {
        let mut readings = HashMap::new();
        for (pidfile_id, hostname) in pidfiles {
            let raw = match tokio::fs::read_to_string(pidfile_id.path()).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    warn!("读取pidfile失败 {}: {}", pidfile_id, e);
                    String::new()
                }
            };
            let reading = parse_pidfile(pidfile_id.path(), hostname, &raw).map_err(|e| e.to_string());
            readings.insert(pidfile_id.clone(), reading);
        }
        readings
    }

    fn choose_drone(state: &DroneState, num_processes: usize) -> Option<usize> {
        let mut candidates: Vec<usize> = state
            .drones
            .iter()
            .enumerate()
            .filter(|(_, d)| d.enabled)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|a, b| {
            state.drones[*a]
                .used_capacity()
                .partial_cmp(&state.drones[*b].used_capacity())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let fitting = candidates.iter().copied().find(|i| {
            let drone = &state.drones[*i];
            drone.active_processes + num_processes <= drone.max_processes
        });
        if fitting.is_none() && !candidates.is_empty() {
            error!("没有drone能容纳{}个进程，使用负载最低的drone", num_processes);
        }
        fitting.or_else(|| candidates.first().copied())
    }

    async fn execute_call(&self, call: DroneCall) {
        match call {
            DroneCall::Execute {
                command,
                working_directory,
                log_file,
                pidfile_name,
            } => {
                if let Err(e) =
                    spawn_command(&command, &working_directory, &log_file, &pidfile_name).await
                {
                    error!("启动命令失败 {:?}: {}", command, e);
                }
            }
            DroneCall::Kill(process) => {
                info!("终止进程 {}", process);
                if let Err(e) = procfs::terminate(process.pid) {
                    warn!("{}", e);
                }
            }
            DroneCall::Copy {
                source,
                destination,
            } => {
                if source == destination {
                    return;
                }
                let result = tokio::task::spawn_blocking(move || copy_path(&source, &destination)).await;
                match result {
                    Ok(Err(e)) => warn!("复制结果失败: {}", e),
                    Err(e) => error!("复制任务异常: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            DroneCall::WriteFile { path, contents } => {
                if let Err(e) = append_to_file(&path, &contents).await {
                    warn!("写入文件失败 {}: {}", path.display(), e);
                }
            }
        }
    }
}

async fn append_to_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await
}

async fn spawn_command(
    command: &[String],
    working_directory: &Path,
    log_file: &Path,
    pidfile_name: &str,
) -> std::io::Result<()> {
    let (program, args) = command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "空命令")
    })?;

    tokio::fs::create_dir_all(working_directory).await?;
    let pidfile_path = working_directory.join(pidfile_name);
    if tokio::fs::try_exists(&pidfile_path).await.unwrap_or(false) {
        warn!("pidfile已存在，删除: {}", pidfile_path.display());
        tokio::fs::remove_file(&pidfile_path).await?;
    }

    let separator = "*".repeat(80);
    append_to_file(
        log_file,
        &format!(
            "\n{separator}\n{}> {}\n{separator}\n",
            Utc::now().format("%X %x"),
            command.join(" ")
        ),
    )
    .await?;

    let log = std::fs::OpenOptions::new().append(true).open(log_file)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    debug!("已启动进程 pid={:?}: {}", child.id(), command.join(" "));
    Ok(())
}

fn copy_path(source: &Path, destination: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(destination)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &destination.join(entry.file_name()))?;
        }
        Ok(())
    } else if source.exists() {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, destination).map(|_| ())
    } else {
        debug!("复制源不存在，跳过: {}", source.display());
        Ok(())
    }
}

#[async_trait]
impl DroneManager for LocalDroneManager {
    async fn refresh(&self) -> SchedulerResult<()> {
        let (to_read, drone_hostnames): (Vec<(PidfileId, String)>, Vec<String>) = {
            let mut state = self.state.lock().await;
            state.pidfiles.clear();
            state.pidfiles_second_read.clear();
            state.processes.clear();
            state.orphans.clear();

            let max_refreshes = self.max_pidfile_refreshes;
            let leaked: Vec<PidfileId> = state
                .registered
                .iter()
                .filter(|(_, info)| info.age > max_refreshes)
                .map(|(id, _)| id.clone())
                .collect();
            for pidfile_id in leaked {
                warn!("丢弃泄漏的pidfile {}", pidfile_id);
                state.registered.remove(&pidfile_id);
            }
            for info in state.registered.values_mut() {
                info.age += 1;
            }

            let default_drone = state
                .drones
                .first()
                .map(|d| d.hostname.clone())
                .unwrap_or_default();
            let to_read = state
                .registered
                .iter()
                .map(|(id, info)| {
                    (
                        id.clone(),
                        info.drone.clone().unwrap_or_else(|| default_drone.clone()),
                    )
                })
                .collect();
            let hostnames = state.drones.iter().map(|d| d.hostname.clone()).collect();
            (to_read, hostnames)
        };

        let first_read = self.read_pidfiles(&to_read).await;

        // 所有drone共享本机的进程表
        let mut processes = HashSet::new();
        let mut orphans = Vec::new();
        for info in procfs::scan_processes(&self.process_names).await {
            if info.comm == self.autoserv_name {
                // 只统计进程组的根进程
                if info.pgid != info.pid {
                    continue;
                }
                if info.ppid == 1 {
                    if let Some(hostname) = drone_hostnames.first() {
                        orphans.push(Process::new(hostname.clone(), info.pid).with_ppid(info.ppid));
                    }
                }
            }
            for hostname in &drone_hostnames {
                processes.insert(Process::new(hostname.clone(), info.pid).with_ppid(info.ppid));
            }
        }
        for reading in first_read.values() {
            if let Ok(PidfileContents {
                process: Some(process),
                exit_status: None,
                ..
            }) = reading
            {
                if let Some(info) = procfs::read_process(process.pid).await {
                    processes.insert(process.clone().with_ppid(info.ppid));
                }
            }
        }

        let second_read = self.read_pidfiles(&to_read).await;

        let mut state = self.state.lock().await;
        let mut active: HashMap<String, usize> = HashMap::new();
        for (pidfile_id, reading) in &first_read {
            if let Ok(contents) = reading {
                if let (Some(process), None) = (&contents.process, contents.exit_status) {
                    let count = state
                        .registered
                        .get(pidfile_id)
                        .and_then(|info| info.num_processes)
                        .unwrap_or(0);
                    *active.entry(process.hostname.clone()).or_default() += count;
                }
            }
        }
        for drone in state.drones.iter_mut() {
            drone.active_processes = active.get(&drone.hostname).copied().unwrap_or(0);
        }
        state.pidfiles = first_read;
        state.pidfiles_second_read = second_read;
        state.processes = processes;
        state.orphans = orphans;

        debug!(
            "drone刷新完成: {}个pidfile, {}个进程",
            state.pidfiles.len(),
            state.processes.len()
        );
        Ok(())
    }

    async fn execute_actions(&self) -> SchedulerResult<()> {
        let calls = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.queued_calls)
        };
        for call in calls {
            self.execute_call(call).await;
        }
        Ok(())
    }

    async fn run(&self, request: RunRequest) -> SchedulerResult<PidfileId> {
        let mut state = self.state.lock().await;

        let drone_index = match &request.paired_with_pidfile {
            Some(paired) => {
                let hostname = state
                    .pidfiles
                    .get(paired)
                    .and_then(|r| r.as_ref().ok())
                    .and_then(|c| c.process.as_ref())
                    .map(|p| p.hostname.clone());
                hostname
                    .and_then(|h| state.drones.iter().position(|d| d.hostname == h))
                    .or_else(|| Self::choose_drone(&state, request.num_processes))
            }
            None => Self::choose_drone(&state, request.num_processes),
        }
        .ok_or_else(|| {
            SchedulerError::drone_error(format!("没有可用的drone执行命令: {:?}", request.command))
        })?;

        let log_file = match &request.log_file {
            Some(path) => path.clone(),
            None => {
                state.temporary_path_counter += 1;
                format!("{TEMPORARY_DIRECTORY}/execute.{}", state.temporary_path_counter)
            }
        };

        let mut command = Vec::with_capacity(request.command.len() + 3);
        if let Some(level) = request.nice_level {
            command.extend(["nice".to_string(), "-n".to_string(), level.to_string()]);
        }
        command.extend(request.command.iter().cloned());

        let drone_hostname = state.drones[drone_index].hostname.clone();
        info!("command = {:?}", command);
        info!("log file = {}:{}", drone_hostname, log_file);

        let abs_working_directory = self.absolute(&request.working_directory);
        let attached = state
            .attached_files
            .remove(&request.working_directory)
            .unwrap_or_default();
        for (file_path, contents) in attached {
            state.queued_calls.push(DroneCall::WriteFile {
                path: self.absolute(&file_path),
                contents,
            });
        }
        state.queued_calls.push(DroneCall::Execute {
            command,
            working_directory: abs_working_directory.clone(),
            log_file: self.absolute(&log_file),
            pidfile_name: request.pidfile_name.clone(),
        });
        state.drones[drone_index].active_processes += request.num_processes;

        let pidfile_id = PidfileId::new(
            abs_working_directory
                .join(&request.pidfile_name)
                .to_string_lossy()
                .into_owned(),
        );
        let info = state.registered.entry(pidfile_id.clone()).or_default();
        info.age = 0;
        info.num_processes = Some(request.num_processes);
        info.drone = Some(drone_hostname);
        Ok(pidfile_id)
    }

    fn get_pidfile_id_from(&self, execution_tag: &str, pidfile_name: &str) -> PidfileId {
        PidfileId::new(
            self.absolute(execution_tag)
                .join(pidfile_name)
                .to_string_lossy()
                .into_owned(),
        )
    }

    async fn register_pidfile(&self, pidfile_id: &PidfileId) {
        let mut state = self.state.lock().await;
        if !state.registered.contains_key(pidfile_id) {
            info!("监控pidfile {}", pidfile_id);
        }
        state.registered.entry(pidfile_id.clone()).or_default().age = 0;
    }

    async fn unregister_pidfile(&self, pidfile_id: &PidfileId) {
        let mut state = self.state.lock().await;
        if state.registered.remove(pidfile_id).is_some() {
            info!("不再监控pidfile {}", pidfile_id);
        }
    }

    async fn declare_process_count(&self, pidfile_id: &PidfileId, num_processes: usize) {
        let mut state = self.state.lock().await;
        if let Some(info) = state.registered.get_mut(pidfile_id) {
            info.num_processes = Some(num_processes);
        }
    }

    async fn get_pidfile_contents(
        &self,
        pidfile_id: &PidfileId,
        use_second_read: bool,
    ) -> SchedulerResult<PidfileContents> {
        let mut state = self.state.lock().await;
        if let Some(info) = state.registered.get_mut(pidfile_id) {
            info.age = 0;
        }
        let map = if use_second_read {
            &state.pidfiles_second_read
        } else {
            &state.pidfiles
        };
        match map.get(pidfile_id) {
            None => Ok(PidfileContents::default()),
            Some(Ok(contents)) => Ok(contents.clone()),
            Some(Err(message)) => Err(SchedulerError::InvalidPidfile {
                path: pidfile_id.to_string(),
                message: message.clone(),
            }),
        }
    }

    async fn is_process_running(&self, process: &Process) -> bool {
        self.state.lock().await.processes.contains(process)
    }

    async fn kill_process(&self, process: &Process) {
        info!("killing {}", process);
        self.state
            .lock()
            .await
            .queued_calls
            .push(DroneCall::Kill(process.clone()));
    }

    async fn max_runnable_processes(&self) -> usize {
        let state = self.state.lock().await;
        state
            .drones
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.max_processes.saturating_sub(d.active_processes))
            .sum()
    }

    async fn total_running_processes(&self) -> usize {
        let state = self.state.lock().await;
        state.drones.iter().map(|d| d.active_processes).sum()
    }

    async fn get_orphaned_autoserv_processes(&self) -> Vec<Process> {
        self.state.lock().await.orphans.clone()
    }

    async fn get_temporary_path(&self, base_name: &str) -> String {
        let mut state = self.state.lock().await;
        state.temporary_path_counter += 1;
        format!(
            "{TEMPORARY_DIRECTORY}/{base_name}.{}",
            state.temporary_path_counter
        )
    }

    fn absolute_path(&self, path: &str) -> String {
        self.absolute(path).to_string_lossy().into_owned()
    }

    async fn copy_to_results_repository(
        &self,
        _process: &Process,
        source_path: &str,
        destination_path: Option<&str>,
    ) {
        let destination = destination_path.unwrap_or(source_path);
        self.state.lock().await.queued_calls.push(DroneCall::Copy {
            source: self.absolute(source_path),
            destination: self.absolute(destination),
        });
    }

    async fn copy_results_on_drone(
        &self,
        _process: &Process,
        source_path: &str,
        destination_path: &str,
    ) {
        self.state.lock().await.queued_calls.push(DroneCall::Copy {
            source: self.absolute(source_path),
            destination: self.absolute(destination_path),
        });
    }

    async fn attach_file_to_execution(
        &self,
        results_dir: &str,
        file_contents: &str,
        file_path: Option<&str>,
    ) -> String {
        let mut state = self.state.lock().await;
        let file_path = match file_path {
            Some(path) => path.to_string(),
            None => {
                state.temporary_path_counter += 1;
                format!("{TEMPORARY_DIRECTORY}/attach.{}", state.temporary_path_counter)
            }
        };
        state
            .attached_files
            .entry(results_dir.to_string())
            .or_default()
            .push((file_path.clone(), file_contents.to_string()));
        file_path
    }

    async fn write_lines_to_file(
        &self,
        file_path: &str,
        lines: &[String],
        _paired_with_process: Option<&Process>,
    ) {
        let mut contents = lines.join("\n");
        contents.push('\n');
        self.state.lock().await.queued_calls.push(DroneCall::WriteFile {
            path: self.absolute(file_path),
            contents,
        });
    }
}
