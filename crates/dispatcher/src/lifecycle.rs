//! 队列条目与作业的状态推进
//!
//! 所有函数都以条目/作业 id 为参数，每次从仓储重新加载，避免在一次tick中
//! 使用被其他任务修改过的旧数据。

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    HostProtection, HostQueueEntry, HostQueueEntryStatus, HostStatus, Job, RebootBefore,
    SpecialTask, SpecialTaskKind,
};
use scheduler_drone::ALL_PIDFILE_NAMES;
use tracing::{error, info};

use crate::context::SchedulerContext;
use crate::tasks::DelayedCallTask;

pub async fn set_status(
    ctx: &SchedulerContext,
    entry_id: i64,
    status: HostQueueEntryStatus,
) -> SchedulerResult<()> {
    let entry = ctx.entry(entry_id).await?;
    info!("{} 状态变更为 {}", entry.entry_description(), status);
    ctx.repos.entries.update_status(entry_id, status).await?;

    if !status.is_complete() {
        return Ok(());
    }
    if status != HostQueueEntryStatus::Aborted {
        stop_if_necessary(ctx, entry.job_id).await?;
    }
    if !entry.execution_subdir.is_empty() {
        let job = ctx.job(entry.job_id).await?;
        let execution_tag = entry.execution_tag(&job);
        for pidfile_name in ALL_PIDFILE_NAMES {
            let pidfile_id = ctx
                .drone_manager
                .get_pidfile_id_from(&execution_tag, pidfile_name);
            ctx.drone_manager.unregister_pidfile(&pidfile_id).await;
        }
    }
    Ok(())
}

pub async fn set_host_status(
    ctx: &SchedulerContext,
    host_id: i64,
    status: HostStatus,
) -> SchedulerResult<()> {
    let host = ctx.host(host_id).await?;
    info!("主机 {} 状态变更为 {}", host.hostname, status);
    ctx.repos.hosts.update_status(host_id, status).await
}

/// 分配或释放主机，同时维护同一作业禁止重复使用主机的记录
pub async fn set_host(
    ctx: &SchedulerContext,
    entry_id: i64,
    host_id: Option<i64>,
) -> SchedulerResult<()> {
    let entry = ctx.entry(entry_id).await?;
    match host_id {
        Some(host_id) => {
            ctx.repos.entries.update_host(entry_id, Some(host_id)).await?;
            ctx.repos
                .ineligible_hosts
                .block(entry.job_id, host_id)
                .await?;
        }
        None => {
            if let Some(old_host) = entry.host_id {
                ctx.repos
                    .ineligible_hosts
                    .unblock(entry.job_id, old_host)
                    .await?;
            }
            ctx.repos.entries.update_host(entry_id, None).await?;
        }
    }
    Ok(())
}

/// 缺省使用主机名作为子目录
pub async fn set_execution_subdir(
    ctx: &SchedulerContext,
    entry_id: i64,
    subdir: Option<&str>,
) -> SchedulerResult<()> {
    let subdir = match subdir {
        Some(subdir) => subdir.to_string(),
        None => {
            let entry = ctx.entry(entry_id).await?;
            ctx.host_of(&entry).await?.hostname
        }
    };
    ctx.repos
        .entries
        .update_execution_subdir(entry_id, &subdir)
        .await
}

pub async fn set_started_on_now(ctx: &SchedulerContext, entry_id: i64) -> SchedulerResult<()> {
    ctx.repos
        .entries
        .update_started_on(entry_id, Some(ctx.now()))
        .await
}

/// 放回队列；元主机和原子组条目同时释放主机，以便重新挑选
pub async fn requeue(ctx: &SchedulerContext, entry_id: i64) -> SchedulerResult<()> {
    set_status(ctx, entry_id, HostQueueEntryStatus::Queued).await?;
    ctx.repos.entries.update_started_on(entry_id, None).await?;
    ctx.repos
        .entries
        .update_execution_subdir(entry_id, "")
        .await?;
    let entry = ctx.entry(entry_id).await?;
    if entry.is_metahost() || entry.atomic_group_id.is_some() {
        set_host(ctx, entry_id, None).await?;
    }
    Ok(())
}

pub async fn create_special_task(
    ctx: &SchedulerContext,
    host_id: i64,
    kind: SpecialTaskKind,
    queue_entry_id: Option<i64>,
    requested_by: Option<String>,
) -> SchedulerResult<SpecialTask> {
    let task = SpecialTask::new(host_id, kind, queue_entry_id, requested_by, ctx.now());
    let task = ctx.repos.special_tasks.create(&task).await?;
    info!("创建特殊任务 {} {} (host {})", task.id, task.task, host_id);
    Ok(task)
}

/// 预处理任务（清理/验证）成功后调用
pub async fn on_pending(ctx: &SchedulerContext, entry_id: i64) -> SchedulerResult<()> {
    set_status(ctx, entry_id, HostQueueEntryStatus::Pending).await?;
    let entry = ctx.entry(entry_id).await?;
    let host = ctx.host_of(&entry).await?;
    set_host_status(ctx, host.id, HostStatus::Pending).await?;

    let job = ctx.job(entry.job_id).await?;
    run_if_ready(ctx, &job, entry_id).await?;

    let entry = ctx.entry(entry_id).await?;
    if job.synch_count == 1 && entry.status == HostQueueEntryStatus::Pending {
        let subject = format!("Job {} (id {})", job.name, job.id);
        let message = format!(
            "Asynchronous job stuck in Pending\nEntry: {}\nHost: {}",
            entry.entry_description(),
            host.hostname
        );
        ctx.email.enqueue_admin(&subject, &message);
    }
    Ok(())
}

/// 中止条目。收尾阶段（Gathering/Parsing/Archiving）的条目由后处理任务负责
pub async fn abort_entry(ctx: &SchedulerContext, entry_id: i64) -> SchedulerResult<()> {
    use HostQueueEntryStatus::*;

    let entry = ctx.entry(entry_id).await?;
    if matches!(entry.status, Gathering | Parsing | Archiving) {
        return Ok(());
    }

    match (entry.status, entry.host_id) {
        (Starting | Pending | Running | Waiting, Some(host_id)) => {
            set_host_status(ctx, host_id, HostStatus::Ready).await?;
        }
        (Verifying, Some(host_id)) => {
            let job = ctx.job(entry.job_id).await?;
            create_special_task(
                ctx,
                host_id,
                SpecialTaskKind::Cleanup,
                None,
                Some(job.owner.clone()),
            )
            .await?;
        }
        _ => {}
    }

    set_status(ctx, entry_id, Aborted).await?;
    abort_delay_task(ctx, entry.job_id);
    Ok(())
}

/// 原子组作业使用的目录名前缀：优先使用指定了该原子组的标签名
pub async fn get_group_name(
    ctx: &SchedulerContext,
    job: &Job,
    entry: &HostQueueEntry,
) -> SchedulerResult<String> {
    let Some(group_id) = entry.atomic_group_id else {
        return Ok(String::new());
    };
    let group = ctx
        .repos
        .labels
        .find_atomic_group(group_id)
        .await?
        .ok_or(SchedulerError::AtomicGroupNotFound { id: group_id })?;

    let labels = ctx.repos.labels.find_all().await?;
    let wanted = entry.meta_host.iter().chain(job.dependency_labels.iter());
    for label_id in wanted {
        if let Some(label) = labels.iter().find(|l| l.id == *label_id) {
            if label.atomic_group_id.is_some() {
                return Ok(label.name.clone());
            }
        }
    }
    Ok(group.name)
}

async fn count_entries(
    ctx: &SchedulerContext,
    job_id: i64,
    statuses: &[HostQueueEntryStatus],
) -> SchedulerResult<usize> {
    Ok(ctx
        .repos
        .entries
        .find_by_job(job_id)
        .await?
        .iter()
        .filter(|e| statuses.contains(&e.status))
        .count())
}

async fn pending_count(ctx: &SchedulerContext, job_id: i64) -> SchedulerResult<usize> {
    count_entries(ctx, job_id, &[HostQueueEntryStatus::Pending]).await
}

/// 原子组作业只运行一次
async fn atomic_and_has_started(ctx: &SchedulerContext, job_id: i64) -> SchedulerResult<bool> {
    let entries = ctx.repos.entries.find_by_job(job_id).await?;
    let atomic: Vec<_> = entries
        .iter()
        .filter(|e| e.atomic_group_id.is_some())
        .collect();
    Ok(!atomic.is_empty() && atomic.iter().any(|e| e.status.is_started()))
}

pub async fn is_ready(ctx: &SchedulerContext, job: &Job) -> SchedulerResult<bool> {
    let pending = pending_count(ctx, job.id).await?;
    Ok(pending >= job.synch_count.max(0) as usize && !atomic_and_has_started(ctx, job.id).await?)
}

/// 剩余可运行的条目不足 synch_count 时停止作业中尚未运行的条目
pub async fn stop_if_necessary(ctx: &SchedulerContext, job_id: i64) -> SchedulerResult<()> {
    use HostQueueEntryStatus::*;

    let job = ctx.job(job_id).await?;
    let not_yet_run = count_entries(ctx, job_id, &[Queued, Verifying, Pending, Waiting]).await?;
    if not_yet_run >= job.synch_count.max(0) as usize {
        return Ok(());
    }

    for entry in ctx.repos.entries.find_by_job(job_id).await? {
        if !matches!(entry.status, Queued | Pending | Waiting) {
            continue;
        }
        if matches!(entry.status, Pending | Waiting) {
            if let Some(host_id) = entry.host_id {
                set_host_status(ctx, host_id, HostStatus::Ready).await?;
            }
        }
        info!("停止 {}", entry.entry_description());
        ctx.repos.entries.update_status(entry.id, Stopped).await?;
    }
    Ok(())
}

fn should_run_cleanup(job: &Job, host_dirty: bool) -> bool {
    match job.reboot_before {
        RebootBefore::Always => true,
        RebootBefore::IfDirty => host_dirty,
        RebootBefore::Never => false,
    }
}

fn should_run_verify(job: &Job, protection: HostProtection) -> bool {
    job.run_verify && protection != HostProtection::DoNotVerify
}

/// 条目分配到主机后安排运行前的清理或验证
pub async fn schedule_pre_job_tasks(ctx: &SchedulerContext, entry_id: i64) -> SchedulerResult<()> {
    let entry = ctx.entry(entry_id).await?;
    let job = ctx.job(entry.job_id).await?;
    let host = ctx.host_of(&entry).await?;

    let kind = if should_run_cleanup(&job, host.dirty) {
        SpecialTaskKind::Cleanup
    } else if should_run_verify(&job, host.protection) {
        SpecialTaskKind::Verify
    } else {
        return on_pending(ctx, entry_id).await;
    };

    set_status(ctx, entry_id, HostQueueEntryStatus::Verifying).await?;
    create_special_task(ctx, host.id, kind, Some(entry_id), None).await?;
    Ok(())
}

pub async fn run_if_ready(ctx: &SchedulerContext, job: &Job, entry_id: i64) -> SchedulerResult<()> {
    if !is_ready(ctx, job).await? {
        return stop_if_necessary(ctx, job.id).await;
    }
    let entry = ctx.entry(entry_id).await?;
    if entry.atomic_group_id.is_some() {
        run_with_ready_delay(ctx, job, &entry).await
    } else {
        run_job(ctx, job, entry_id).await
    }
}

/// 原子组作业在凑满主机或等待超时之前进入 Waiting
async fn run_with_ready_delay(
    ctx: &SchedulerContext,
    job: &Job,
    entry: &HostQueueEntry,
) -> SchedulerResult<()> {
    let delay = ctx.config.secs_to_wait_for_atomic_group_hosts;
    let pending = pending_count(ctx, job.id).await?;
    let over_max_threshold = pending >= max_hosts_needed_to_run(ctx, job, entry).await?;
    let delay_expired = ctx
        .delay_handle(job.id)
        .map(|handle| ctx.now() >= handle.end_time)
        .unwrap_or(false);

    if delay == 0 || over_max_threshold || delay_expired {
        run_job(ctx, job, entry.id).await
    } else {
        set_status(ctx, entry.id, HostQueueEntryStatus::Waiting).await
    }
}

async fn max_hosts_needed_to_run(
    ctx: &SchedulerContext,
    job: &Job,
    entry: &HostQueueEntry,
) -> SchedulerResult<usize> {
    let assigned = ctx
        .repos
        .entries
        .find_by_job(job.id)
        .await?
        .iter()
        .filter(|e| e.host_id.is_some())
        .count();
    let max_machines = match entry.atomic_group_id {
        Some(group_id) => ctx
            .repos
            .labels
            .find_atomic_group(group_id)
            .await?
            .map(|g| g.max_number_of_machines.max(0) as usize)
            .unwrap_or(usize::MAX),
        None => usize::MAX,
    };
    Ok(assigned.min(max_machines))
}

/// 为处于 Waiting 的条目安排延迟调用；同一作业只会创建一个
pub async fn schedule_delayed_callback_task(
    ctx: &SchedulerContext,
    entry_id: i64,
) -> SchedulerResult<Option<DelayedCallTask>> {
    set_status(ctx, entry_id, HostQueueEntryStatus::Pending).await?;
    let entry = ctx.entry(entry_id).await?;
    let end_time = ctx.now() + ctx.config.atomic_group_wait();
    let Some(handle) = ctx.create_delay_handle(entry.job_id, end_time) else {
        return Ok(None);
    };
    info!(
        "作业 {} 等待更多主机就绪，最晚于 {} 开始",
        entry.job_id, end_time
    );
    Ok(Some(DelayedCallTask::new(entry.job_id, entry_id, handle)))
}

pub fn abort_delay_task(ctx: &SchedulerContext, job_id: i64) {
    if let Some(handle) = ctx.remove_delay_handle(job_id) {
        handle.abort();
    }
}

/// 把作业所有未完成的条目标记为中止，下一次tick时处理
pub async fn request_abort(ctx: &SchedulerContext, job_id: i64) -> SchedulerResult<()> {
    for entry in ctx.repos.entries.find_by_job(job_id).await? {
        if !entry.complete() {
            ctx.repos.entries.set_aborted(entry.id).await?;
        }
    }
    Ok(())
}

/// 挑选一组 Pending 条目一起启动，并分配结果子目录
pub async fn run_job(ctx: &SchedulerContext, job: &Job, entry_id: i64) -> SchedulerResult<()> {
    let entry = ctx.entry(entry_id).await?;
    if entry.atomic_group_id.is_some() && atomic_and_has_started(ctx, job.id).await? {
        error!("原子组作业 {} 已经启动过，忽略 {}", job.id, entry.entry_description());
        return Ok(());
    }

    let num_wanted = match entry.atomic_group_id {
        Some(group_id) => ctx
            .repos
            .labels
            .find_atomic_group(group_id)
            .await?
            .ok_or(SchedulerError::AtomicGroupNotFound { id: group_id })?
            .max_number_of_machines,
        None => job.synch_count,
    };
    let num_wanted = (num_wanted.max(0) as usize).saturating_sub(1);

    let mut chosen = vec![entry.clone()];
    if num_wanted > 0 {
        let mut others = Vec::new();
        for other in ctx.repos.entries.find_by_job(job.id).await? {
            if other.id == entry.id || other.status != HostQueueEntryStatus::Pending {
                continue;
            }
            let hostname = match other.host_id {
                Some(host_id) => ctx.host(host_id).await?.hostname,
                None => String::new(),
            };
            others.push((hostname, other));
        }
        others.sort_by(|a, b| scheduler_domain::compare_hostnames(&a.0, &b.0));
        chosen.extend(others.into_iter().take(num_wanted).map(|(_, e)| e));
    }

    if chosen.len() < job.synch_count.max(0) as usize {
        let ids: Vec<i64> = chosen.iter().map(|e| e.id).collect();
        let message = format!(
            "job {} got less than {} chosen entries: {:?}",
            job.id, job.synch_count, ids
        );
        error!("{}", message);
        ctx.email
            .enqueue_admin("Job not started, too few chosen entries", &message);
        return Ok(());
    }

    let subdir = if chosen.len() == 1 {
        ctx.host_of(&chosen[0]).await?.hostname
    } else {
        let group_name = get_group_name(ctx, job, &entry).await?;
        let existing: Vec<String> = ctx
            .repos
            .entries
            .find_by_job(job.id)
            .await?
            .into_iter()
            .map(|e| e.execution_subdir)
            .collect();
        let subdir = next_group_name(&existing, &group_name);
        info!(
            "同步作业 {} 的 {} 个条目作为 {} 一起运行",
            job.id,
            chosen.len(),
            subdir
        );
        subdir
    };

    for chosen_entry in &chosen {
        set_execution_subdir(ctx, chosen_entry.id, Some(&subdir)).await?;
    }
    for chosen_entry in &chosen {
        set_status(ctx, chosen_entry.id, HostQueueEntryStatus::Starting).await?;
    }
    abort_delay_task(ctx, job.id);
    Ok(())
}

/// 下一个组目录名，例如 `rack_a.group2`
pub fn next_group_name(existing_subdirs: &[String], group_name: &str) -> String {
    let mut prefix = String::new();
    if !group_name.is_empty() {
        let sanitized = group_name.replace('/', "_");
        match sanitized.strip_prefix('.') {
            Some(rest) => {
                prefix.push('_');
                prefix.push_str(rest);
            }
            None => prefix.push_str(&sanitized),
        }
        prefix.push('.');
    }
    let group_prefix = format!("{prefix}group");

    let next_id = existing_subdirs
        .iter()
        .filter_map(|subdir| subdir.strip_prefix(&group_prefix))
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().ok()
        })
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);
    format!("{group_prefix}{next_id}")
}

/// 同一作业中共享结果子目录的条目
pub async fn get_group_entries(
    ctx: &SchedulerContext,
    entry: &HostQueueEntry,
) -> SchedulerResult<Vec<HostQueueEntry>> {
    Ok(ctx
        .repos
        .entries
        .find_by_job(entry.job_id)
        .await?
        .into_iter()
        .filter(|e| e.execution_subdir == entry.execution_subdir)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subdirs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_next_group_name_without_label() {
        assert_eq!(next_group_name(&[], ""), "group0");
        assert_eq!(
            next_group_name(&subdirs(&["host1", "group0", "group3", ""]), ""),
            "group4"
        );
    }

    #[test]
    fn test_next_group_name_sanitizes_label() {
        assert_eq!(next_group_name(&[], "rack/a"), "rack_a.group0");
        assert_eq!(next_group_name(&[], ".hidden"), "_hidden.group0");
        assert_eq!(
            next_group_name(&subdirs(&["rack_a.group1", "group7"]), "rack/a"),
            "rack_a.group2"
        );
    }

    #[test]
    fn test_pre_job_task_choice() {
        let mut job = scheduler_testing_utils::JobBuilder::new().build();
        assert!(should_run_cleanup(&job, true));
        assert!(!should_run_cleanup(&job, false));
        job.reboot_before = RebootBefore::Always;
        assert!(should_run_cleanup(&job, false));
        assert!(should_run_verify(&job, HostProtection::NoProtection));
        assert!(!should_run_verify(&job, HostProtection::DoNotVerify));
        job.run_verify = false;
        assert!(!should_run_verify(&job, HostProtection::NoProtection));
    }
}
