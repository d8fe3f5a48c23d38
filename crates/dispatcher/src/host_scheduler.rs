//! 主机分配
//!
//! 每个调度周期开始时批量加载可用主机、作业ACL、禁用记录、主机标签和标签
//! 定义，之后的资格判断全部在内存中完成。已分配的主机在本周期内从可用池中
//! 移除。

use std::collections::{HashMap, HashSet};

use scheduler_core::SchedulerResult;
use scheduler_domain::{AtomicGroup, Host, HostQueueEntry, Job, Label};
use tracing::{debug, error};

use crate::context::SchedulerContext;

/// 原子组条目的分配结果
#[derive(Debug, Clone)]
pub enum AtomicPlacement {
    /// 第一个主机给原条目，其余主机需要克隆新条目
    Hosts(Vec<Host>),
    /// 本周期没有足够的主机
    Unschedulable,
    /// synch_count 超过原子组容量，条目只能中止
    Impossible,
}

#[derive(Debug, Default)]
pub struct HostScheduler {
    hosts_available: HashMap<i64, Host>,
    job_acls: HashMap<i64, HashSet<i64>>,
    ineligible_hosts: HashMap<i64, HashSet<i64>>,
    job_dependencies: HashMap<i64, HashSet<i64>>,
    host_acls: HashMap<i64, HashSet<i64>>,
    label_hosts: HashMap<i64, HashSet<i64>>,
    host_labels: HashMap<i64, HashSet<i64>>,
    labels: HashMap<i64, Label>,
    atomic_groups: HashMap<i64, AtomicGroup>,
}

fn many_to_many(pairs: impl IntoIterator<Item = (i64, i64)>) -> HashMap<i64, HashSet<i64>> {
    let mut result: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (left, right) in pairs {
        result.entry(left).or_default().insert(right);
    }
    result
}

/// 作业优先级降序，非元主机优先，然后按作业、条目先后
pub fn order_pending_entries(entries: &mut [HostQueueEntry], jobs: &HashMap<i64, Job>) {
    entries.sort_by(|a, b| {
        let priority = |e: &HostQueueEntry| jobs.get(&e.job_id).map(|j| j.priority.rank()).unwrap_or(0);
        priority(b)
            .cmp(&priority(a))
            .then_with(|| a.meta_host.is_some().cmp(&b.meta_host.is_some()))
            .then_with(|| a.job_id.cmp(&b.job_id))
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl HostScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(
        &mut self,
        ctx: &SchedulerContext,
        pending: &[HostQueueEntry],
        jobs: &HashMap<i64, Job>,
    ) -> SchedulerResult<()> {
        self.hosts_available = ctx
            .repos
            .hosts
            .find_ready()
            .await?
            .into_iter()
            .map(|h| (h.id, h))
            .collect();

        let mut job_ids: Vec<i64> = pending.iter().map(|e| e.job_id).collect();
        job_ids.sort_unstable();
        job_ids.dedup();

        self.job_acls = many_to_many(ctx.repos.acls.find_job_acl_groups(&job_ids).await?);
        self.ineligible_hosts = many_to_many(
            ctx.repos
                .ineligible_hosts
                .find_for_jobs(&job_ids)
                .await?
                .into_iter()
                .map(|b| (b.job_id, b.host_id)),
        );
        self.job_dependencies = jobs
            .iter()
            .map(|(id, job)| (*id, job.dependency_labels.iter().copied().collect()))
            .collect();

        let host_ids: Vec<i64> = self.hosts_available.keys().copied().collect();
        self.host_acls = many_to_many(ctx.repos.acls.find_host_acl_groups(&host_ids).await?);
        let host_label_pairs = ctx.repos.labels.find_host_labels(&host_ids).await?;
        self.host_labels = many_to_many(host_label_pairs.iter().copied());
        self.label_hosts = many_to_many(host_label_pairs.iter().map(|(h, l)| (*l, *h)));
        self.labels = ctx
            .repos
            .labels
            .find_all()
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();
        self.atomic_groups = ctx
            .repos
            .labels
            .find_atomic_groups()
            .await?
            .into_iter()
            .map(|g| (g.id, g))
            .collect();

        debug!(
            "主机调度刷新：{} 个可用主机，{} 个待调度作业",
            self.hosts_available.len(),
            job_ids.len()
        );
        Ok(())
    }

    pub fn available_host_count(&self) -> usize {
        self.hosts_available.len()
    }

    /// 主机本周期仍可用；一次性主机只能直接指定，不能用于元主机
    pub fn is_host_usable(&self, host_id: i64) -> bool {
        self.hosts_available
            .get(&host_id)
            .map(|h| !h.invalid)
            .unwrap_or(false)
    }

    fn is_host_invalid(&self, host_id: i64) -> bool {
        self.hosts_available
            .get(&host_id)
            .map(|h| h.invalid)
            .unwrap_or(false)
    }

    fn is_acl_accessible(&self, host_id: i64, entry: &HostQueueEntry) -> bool {
        match (self.job_acls.get(&entry.job_id), self.host_acls.get(&host_id)) {
            (Some(job_acls), Some(host_acls)) => !job_acls.is_disjoint(host_acls),
            _ => false,
        }
    }

    fn check_only_if_needed_labels(
        &self,
        dependencies: &HashSet<i64>,
        host_labels: &HashSet<i64>,
        entry: &HostQueueEntry,
    ) -> bool {
        let Some(meta_host) = entry.meta_host else {
            // 直接指定主机时忽略
            return true;
        };
        host_labels.iter().all(|label_id| {
            let only_if_needed = self
                .labels
                .get(label_id)
                .map(|l| l.only_if_needed)
                .unwrap_or(false);
            !only_if_needed || *label_id == meta_host || dependencies.contains(label_id)
        })
    }

    /// 主机标签所属的原子组；多个原子组时记录错误并取 id 最小的
    fn host_atomic_group_id(&self, host_labels: &HashSet<i64>) -> Option<i64> {
        let mut group_ids: Vec<i64> = host_labels
            .iter()
            .filter_map(|id| self.labels.get(id))
            .filter_map(|l| l.atomic_group_id)
            .collect();
        group_ids.sort_unstable();
        group_ids.dedup();
        if group_ids.len() > 1 {
            error!("主机标签属于多个原子组: {:?}", group_ids);
        }
        group_ids.first().copied()
    }

    fn is_host_eligible(
        &self,
        host_id: i64,
        entry: &HostQueueEntry,
        atomic_group_id: Option<i64>,
    ) -> bool {
        if self.is_host_invalid(host_id) {
            // 一次性主机没有标签，跳过资格检查
            return true;
        }
        let empty = HashSet::new();
        let dependencies = self.job_dependencies.get(&entry.job_id).unwrap_or(&empty);
        let host_labels = self.host_labels.get(&host_id).unwrap_or(&empty);

        self.is_acl_accessible(host_id, entry)
            && dependencies.is_subset(host_labels)
            && self.check_only_if_needed_labels(dependencies, host_labels, entry)
            && self.host_atomic_group_id(host_labels) == atomic_group_id
    }

    pub fn is_host_eligible_for_job(&self, host_id: i64, entry: &HostQueueEntry) -> bool {
        self.is_host_eligible(host_id, entry, entry.atomic_group_id)
    }

    fn ineligible_hosts_for(&self, entry: &HostQueueEntry) -> HashSet<i64> {
        self.ineligible_hosts
            .get(&entry.job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 非原子组条目：直接指定的主机或元主机标签下第一个可用主机
    pub fn schedule_entry(&mut self, entry: &HostQueueEntry) -> Option<Host> {
        if let Some(host_id) = entry.host_id {
            if !self.is_host_eligible_for_job(host_id, entry) {
                return None;
            }
            return self.hosts_available.remove(&host_id);
        }

        let label_id = entry.meta_host?;
        let ineligible = self.ineligible_hosts_for(entry);
        let mut candidates: Vec<&Host> = self
            .label_hosts
            .get(&label_id)
            .into_iter()
            .flatten()
            .filter(|id| !ineligible.contains(id))
            .filter(|id| self.is_host_usable(**id))
            .filter(|id| self.is_host_eligible_for_job(**id, entry))
            .filter_map(|id| self.hosts_available.get(id))
            .collect();
        candidates.sort_by(|a, b| Host::cmp_for_sort(a, b));
        let host_id = candidates.first()?.id;

        if let Some(hosts) = self.label_hosts.get_mut(&label_id) {
            hosts.remove(&host_id);
        }
        self.hosts_available.remove(&host_id)
    }

    /// 条目需要的原子组：显式指定，或者由元主机和依赖标签隐含
    pub fn resolve_atomic_group(&self, entry: &HostQueueEntry, job: &Job) -> Result<Option<i64>, Vec<i64>> {
        if let Some(group_id) = entry.atomic_group_id {
            return Ok(Some(group_id));
        }
        let mut group_ids: Vec<i64> = entry
            .meta_host
            .iter()
            .chain(job.dependency_labels.iter())
            .filter_map(|id| self.labels.get(id))
            .filter_map(|l| l.atomic_group_id)
            .collect();
        group_ids.sort_unstable();
        group_ids.dedup();
        match group_ids.len() {
            0 => Ok(None),
            1 => Ok(group_ids.first().copied()),
            _ => Err(group_ids),
        }
    }

    pub fn find_eligible_atomic_group(&mut self, entry: &HostQueueEntry, job: &Job) -> AtomicPlacement {
        let group_id = match self.resolve_atomic_group(entry, job) {
            Ok(Some(group_id)) => group_id,
            Ok(None) => return AtomicPlacement::Unschedulable,
            Err(group_ids) => {
                error!(
                    "{} 同时指向多个原子组 {:?}，无法调度",
                    entry.entry_description(),
                    group_ids
                );
                return AtomicPlacement::Unschedulable;
            }
        };
        let Some(group) = self.atomic_groups.get(&group_id).cloned() else {
            error!("{} 的原子组 {} 不存在", entry.entry_description(), group_id);
            return AtomicPlacement::Unschedulable;
        };

        let min_hosts = job.synch_count.max(1) as usize;
        let max_hosts = group.max_number_of_machines.max(0) as usize;
        if min_hosts > max_hosts {
            error!(
                "作业 {} synch_count={} 超过原子组 {} 的 max_number_of_machines={}，中止条目 {}",
                job.id, job.synch_count, group.id, group.max_number_of_machines, entry.id
            );
            return AtomicPlacement::Impossible;
        }

        let ineligible = self.ineligible_hosts_for(entry);
        let meta_hosts: Option<HashSet<i64>> = entry
            .meta_host
            .map(|label_id| self.label_hosts.get(&label_id).cloned().unwrap_or_default());

        let mut group_labels: Vec<i64> = self
            .labels
            .values()
            .filter(|l| l.atomic_group_id == Some(group.id) && !l.invalid)
            .map(|l| l.id)
            .collect();
        group_labels.sort_unstable();

        for label_id in group_labels {
            let mut eligible: Vec<Host> = self
                .label_hosts
                .get(&label_id)
                .into_iter()
                .flatten()
                .filter(|id| meta_hosts.as_ref().map_or(true, |hosts| hosts.contains(id)))
                .filter(|id| !ineligible.contains(id))
                .filter(|id| self.is_host_usable(**id))
                .filter(|id| self.is_host_eligible(**id, entry, Some(group.id)))
                .filter_map(|id| self.hosts_available.get(id).cloned())
                .collect();
            if eligible.len() < min_hosts {
                continue;
            }

            eligible.sort_by(Host::cmp_for_sort);
            eligible.truncate(max_hosts);
            for host in &eligible {
                self.claim_host(host.id);
            }
            return AtomicPlacement::Hosts(eligible);
        }
        AtomicPlacement::Unschedulable
    }

    fn claim_host(&mut self, host_id: i64) {
        self.hosts_available.remove(&host_id);
        for hosts in self.label_hosts.values_mut() {
            hosts.remove(&host_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::Priority;
    use scheduler_testing_utils::{HostBuilder, JobBuilder, LabelBuilder, QueueEntryBuilder};

    fn scheduler_with(hosts: Vec<Host>, labels: Vec<Label>, host_labels: &[(i64, i64)]) -> HostScheduler {
        let mut scheduler = HostScheduler::new();
        scheduler.hosts_available = hosts.into_iter().map(|h| (h.id, h)).collect();
        scheduler.labels = labels.into_iter().map(|l| (l.id, l)).collect();
        scheduler.host_labels = many_to_many(host_labels.iter().copied());
        scheduler.label_hosts = many_to_many(host_labels.iter().map(|(h, l)| (*l, *h)));
        let host_ids: Vec<i64> = scheduler.hosts_available.keys().copied().collect();
        scheduler.host_acls = host_ids.iter().map(|id| (*id, HashSet::from([1]))).collect();
        scheduler.job_acls = HashMap::from([(1, HashSet::from([1])), (2, HashSet::from([1]))]);
        scheduler
    }

    #[test]
    fn test_pending_order() {
        let jobs = HashMap::from([
            (1, JobBuilder::new().with_id(1).build()),
            (2, JobBuilder::new().with_id(2).with_priority(Priority::Urgent).build()),
        ]);
        let mut entries = vec![
            QueueEntryBuilder::new().with_id(10).with_job(1).with_meta_host(5).build(),
            QueueEntryBuilder::new().with_id(11).with_job(1).with_host(1).build(),
            QueueEntryBuilder::new().with_id(12).with_job(2).with_meta_host(5).build(),
        ];
        order_pending_entries(&mut entries, &jobs);
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![12, 11, 10]);
    }

    #[test]
    fn test_equal_priority_orders_by_job() {
        let jobs = HashMap::from([
            (1, JobBuilder::new().with_id(1).build()),
            (2, JobBuilder::new().with_id(2).build()),
        ]);
        let mut entries = vec![
            QueueEntryBuilder::new().with_id(20).with_job(2).with_host(1).build(),
            QueueEntryBuilder::new().with_id(21).with_job(1).with_host(1).build(),
        ];
        order_pending_entries(&mut entries, &jobs);
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![21, 20]);
    }

    #[test]
    fn test_metahost_skips_only_if_needed_hosts() {
        let hosts = vec![
            HostBuilder::new().with_id(1).with_hostname("host1").build(),
            HostBuilder::new().with_id(2).with_hostname("host2").build(),
        ];
        let labels = vec![
            LabelBuilder::new(5, "x86").build(),
            LabelBuilder::new(6, "gpu").only_if_needed().build(),
        ];
        let mut scheduler = scheduler_with(hosts, labels, &[(1, 5), (1, 6), (2, 5)]);
        let entry = QueueEntryBuilder::new().with_job(1).with_meta_host(5).build();

        let host = scheduler.schedule_entry(&entry).unwrap();
        assert_eq!(host.hostname, "host2");
        assert!(scheduler.schedule_entry(&entry).is_none());
    }

    #[test]
    fn test_atomic_group_hosts_never_serve_plain_jobs() {
        let hosts = vec![HostBuilder::new().with_id(1).with_hostname("host1").build()];
        let labels = vec![LabelBuilder::new(7, "rack").with_atomic_group(3).build()];
        let mut scheduler = scheduler_with(hosts, labels, &[(1, 7)]);
        let direct = QueueEntryBuilder::new().with_job(1).with_host(1).build();
        let metahost = QueueEntryBuilder::new().with_job(1).with_meta_host(7).build();

        assert!(scheduler.schedule_entry(&direct).is_none());
        assert!(scheduler.schedule_entry(&metahost).is_none());
    }

    #[test]
    fn test_invalid_host_only_for_direct_entries() {
        let hosts = vec![HostBuilder::new().with_id(1).with_hostname("one-time").invalid().build()];
        let mut scheduler = scheduler_with(hosts, vec![LabelBuilder::new(5, "x86").build()], &[(1, 5)]);
        scheduler.host_acls.clear();

        let metahost = QueueEntryBuilder::new().with_job(1).with_meta_host(5).build();
        assert!(scheduler.schedule_entry(&metahost).is_none());
        let direct = QueueEntryBuilder::new().with_job(1).with_host(1).build();
        assert_eq!(scheduler.schedule_entry(&direct).map(|h| h.id), Some(1));
    }

    #[test]
    fn test_conflicting_implied_atomic_groups() {
        let scheduler = scheduler_with(
            vec![],
            vec![
                LabelBuilder::new(7, "rack-a").with_atomic_group(3).build(),
                LabelBuilder::new(8, "rack-b").with_atomic_group(4).build(),
            ],
            &[],
        );
        let job = JobBuilder::new().with_dependency_labels(vec![8]).build();
        let entry = QueueEntryBuilder::new().with_job(1).with_meta_host(7).build();
        assert_eq!(scheduler.resolve_atomic_group(&entry, &job), Err(vec![3, 4]));
    }
}
