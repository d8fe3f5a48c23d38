mod common;

use chrono::Duration;
use common::TestHarness;
use scheduler_dispatcher::Task;
use scheduler_domain::{HostQueueEntryStatus, IneligibleHostBlock, Priority};
use scheduler_drone::AUTOSERV_PID_FILE;
use scheduler_testing_utils::{atomic_group, JobBuilder, LabelBuilder, QueueEntryBuilder};

fn add_label(harness: &TestHarness, label_id: i64, name: &str, host_ids: &[i64]) {
    harness.db.insert_label(LabelBuilder::new(label_id, name).build());
    for host_id in host_ids {
        harness.db.add_host_label(*host_id, label_id);
    }
}

fn create_metahost_job(harness: &TestHarness, job_id: i64, label_id: i64) -> i64 {
    harness
        .db
        .insert_job(JobBuilder::new().with_id(job_id).build());
    harness
        .db
        .insert_entry(
            QueueEntryBuilder::new()
                .with_job(job_id)
                .with_meta_host(label_id)
                .build(),
        )
        .id
}

#[tokio::test]
async fn test_higher_priority_job_gets_host() {
    let mut harness = TestHarness::new();
    let low = harness
        .create_job(JobBuilder::new().with_id(1).with_priority(Priority::Low).build(), &[1])
        .remove(0);
    let high = harness
        .create_job(JobBuilder::new().with_id(2).with_priority(Priority::High).build(), &[1])
        .remove(0);

    harness.tick().await;

    harness.assert_entry_status(high.id, HostQueueEntryStatus::Verifying);
    harness.assert_entry_status(low.id, HostQueueEntryStatus::Queued);
}

#[tokio::test]
async fn test_equal_priority_earlier_job_gets_host() {
    let mut harness = TestHarness::new();
    let later = harness
        .create_job(JobBuilder::new().with_id(2).build(), &[1])
        .remove(0);
    let earlier = harness
        .create_job(JobBuilder::new().with_id(1).build(), &[1])
        .remove(0);

    harness.tick().await;

    harness.assert_entry_status(earlier.id, HostQueueEntryStatus::Verifying);
    harness.assert_entry_status(later.id, HostQueueEntryStatus::Queued);
}

#[tokio::test]
async fn test_metahost_assigns_host_and_blocks_it() {
    let mut harness = TestHarness::new();
    add_label(&harness, 1, "label1", &[1, 2]);
    let entry_id = create_metahost_job(&harness, 1, 1);

    harness.tick().await;

    let entry = harness.entry(entry_id);
    assert_eq!(entry.host_id, Some(1));
    assert_eq!(entry.status, HostQueueEntryStatus::Verifying);
    assert!(harness
        .db
        .ineligible_blocks()
        .contains(&IneligibleHostBlock { job_id: 1, host_id: 1 }));
}

#[tokio::test]
async fn test_direct_entry_scheduled_before_metahost() {
    let mut harness = TestHarness::new();
    add_label(&harness, 1, "label1", &[1]);
    let meta_id = create_metahost_job(&harness, 1, 1);
    let direct = harness.create_simple_job(2, 1);

    harness.tick().await;

    harness.assert_entry_status(direct.id, HostQueueEntryStatus::Verifying);
    let meta = harness.entry(meta_id);
    assert_eq!(meta.status, HostQueueEntryStatus::Queued);
    assert_eq!(meta.host_id, None);
}

#[tokio::test]
async fn test_metahost_respects_dependency_labels() {
    let mut harness = TestHarness::new();
    add_label(&harness, 1, "label1", &[1, 2]);
    add_label(&harness, 2, "has_gpu", &[2]);
    harness.db.insert_job(
        JobBuilder::new()
            .with_dependency_labels(vec![2])
            .build(),
    );
    let entry = harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_meta_host(1).build());

    harness.tick().await;

    assert_eq!(harness.entry(entry.id).host_id, Some(2));
}

#[tokio::test]
async fn test_metahost_skips_only_if_needed_hosts() {
    let mut harness = TestHarness::new();
    add_label(&harness, 1, "label1", &[1, 2]);
    harness
        .db
        .insert_label(LabelBuilder::new(2, "reserved").only_if_needed().build());
    harness.db.add_host_label(1, 2);
    let entry_id = create_metahost_job(&harness, 1, 1);

    harness.tick().await;

    assert_eq!(harness.entry(entry_id).host_id, Some(2));
}

#[tokio::test]
async fn test_host_outside_acl_is_not_used() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_owner("stranger").build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Queued);
    assert!(harness.db.special_tasks().is_empty());
}

fn setup_atomic_group(harness: &TestHarness, max_machines: i32) {
    harness
        .db
        .insert_atomic_group(atomic_group(1, "atomic1", max_machines));
    harness.db.insert_label(
        LabelBuilder::new(1, "label1")
            .with_atomic_group(1)
            .build(),
    );
    for host_id in 1..=3 {
        harness.db.add_host_label(host_id, 1);
    }
}

#[tokio::test]
async fn test_atomic_group_entry_spreads_over_group_hosts() {
    let mut harness = TestHarness::new();
    setup_atomic_group(&harness, 2);
    harness
        .db
        .insert_job(JobBuilder::new().with_synch_count(2).build());
    harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_atomic_group(1).build());

    harness.tick().await;

    let entries = harness.db.entries_for_job(1);
    assert_eq!(entries.len(), 2);
    let mut hosts: Vec<Option<i64>> = entries.iter().map(|e| e.host_id).collect();
    hosts.sort();
    assert_eq!(hosts, vec![Some(1), Some(2)]);
    for entry in &entries {
        assert_eq!(entry.status, HostQueueEntryStatus::Verifying);
        assert_eq!(entry.atomic_group_id, Some(1));
    }
}

#[tokio::test]
async fn test_atomic_group_too_small_aborts_entry() {
    let mut harness = TestHarness::new();
    setup_atomic_group(&harness, 2);
    harness
        .db
        .insert_job(JobBuilder::new().with_synch_count(3).build());
    let entry = harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_atomic_group(1).build());

    harness.tick().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    assert_eq!(harness.db.entries_for_job(1).len(), 1);
}

#[tokio::test]
async fn test_plain_metahost_never_uses_atomic_group_hosts() {
    let mut harness = TestHarness::new();
    setup_atomic_group(&harness, 2);
    let entry_id = create_metahost_job(&harness, 1, 1);

    harness.run_dispatcher().await;

    let entry = harness.entry(entry_id);
    assert_eq!(entry.status, HostQueueEntryStatus::Queued);
    assert_eq!(entry.host_id, None);
}

#[tokio::test]
async fn test_atomic_job_stays_within_one_label_instance() {
    let mut harness = TestHarness::new();
    harness
        .db
        .insert_atomic_group(atomic_group(1, "rack", 3));
    for (label_id, name, host_ids) in [(1, "rackA", &[1, 2][..]), (2, "rackB", &[3, 4, 5][..])] {
        harness.db.insert_label(
            LabelBuilder::new(label_id, name)
                .with_atomic_group(1)
                .build(),
        );
        for host_id in host_ids {
            harness.db.add_host_label(*host_id, label_id);
        }
    }
    harness
        .db
        .insert_job(JobBuilder::new().with_synch_count(3).build());
    harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_atomic_group(1).build());

    harness.tick().await;

    let mut hosts: Vec<Option<i64>> = harness
        .db
        .entries_for_job(1)
        .iter()
        .map(|e| e.host_id)
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec![Some(3), Some(4), Some(5)]);
}

#[tokio::test]
async fn test_atomic_job_waits_for_more_hosts_then_runs() {
    let mut harness = TestHarness::new();
    setup_atomic_group(&harness, 3);
    harness
        .db
        .insert_job(JobBuilder::new().with_synch_count(2).build());
    harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_atomic_group(1).build());

    harness.tick().await;
    assert_eq!(harness.db.entries_for_job(1).len(), 3);

    for task in harness.db.special_tasks() {
        if task.host_id != 3 {
            let working_directory = task.execution_path(&format!("host{}", task.host_id));
            harness
                .drone
                .finish_specific_process(&working_directory, AUTOSERV_PID_FILE);
        }
    }
    harness.run_dispatcher().await;

    // 两台主机已就绪，但还没凑满三台：等待延迟调用
    for entry in harness.db.entries_for_job(1) {
        let expected = if entry.host_id == Some(3) {
            HostQueueEntryStatus::Verifying
        } else {
            HostQueueEntryStatus::Pending
        };
        assert_eq!(entry.status, expected);
    }
    assert!(harness
        .dispatcher
        .agents()
        .iter()
        .any(|agent| matches!(agent.task(), Task::DelayedCall(_))));

    harness.clock.advance(Duration::seconds(601));
    harness.run_dispatcher().await;

    let running: Vec<Option<i64>> = harness
        .db
        .entries_for_job(1)
        .iter()
        .filter(|e| e.status == HostQueueEntryStatus::Running)
        .map(|e| e.host_id)
        .collect();
    assert_eq!(running.len(), 2);
    assert!(!running.contains(&Some(3)));
}
