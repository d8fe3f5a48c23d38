mod common;

use chrono::Duration;
use common::TestHarness;
use scheduler_core::SchedulerConfig;
use scheduler_domain::{HostQueueEntryStatus, HostStatus};
use scheduler_testing_utils::{JobBuilder, PidfileType};

#[tokio::test]
async fn test_timed_out_job_is_aborted() {
    let mut harness = TestHarness::new();
    harness.db.update_host(1, |h| h.locked = true);
    let job = JobBuilder::new().with_timeout_hrs(1).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.tick().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Queued);

    harness.clock.advance(Duration::hours(2));
    harness.tick().await;
    assert!(harness.entry(entry.id).aborted);

    harness.tick().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
}

#[tokio::test]
async fn test_cleanup_waits_for_interval() {
    let mut harness = TestHarness::new();
    harness.db.update_host(1, |h| h.locked = true);
    let job = JobBuilder::new().with_timeout_hrs(0).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.clock.advance(Duration::minutes(30));
    harness.tick().await;
    assert!(!harness.entry(entry.id).aborted);

    harness.clock.advance(Duration::minutes(31));
    harness.tick().await;
    assert!(harness.entry(entry.id).aborted);
}

#[tokio::test]
async fn test_job_past_max_runtime_is_killed() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new()
        .with_run_verify(false)
        .with_max_runtime_hrs(1)
        .build();
    let entry = harness.create_job(job, &[1]).remove(0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);

    harness.clock.advance(Duration::hours(2));
    harness.tick().await;
    assert!(harness.entry(entry.id).aborted);

    harness.tick().await;
    assert!(harness.drone.was_last_process_killed(PidfileType::Job));
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Gathering);
}

#[tokio::test]
async fn test_synchronous_job_waiting_too_long_is_aborted() {
    let mut harness = TestHarness::new();
    harness.db.update_host(2, |h| h.locked = true);
    let job = JobBuilder::new()
        .with_synch_count(2)
        .with_run_verify(false)
        .build();
    let entries = harness.create_job(job, &[1, 2]);

    harness.tick().await;
    harness.assert_entry_status(entries[0].id, HostQueueEntryStatus::Pending);
    harness.assert_host_status(1, HostStatus::Pending);

    harness.clock.advance(Duration::hours(5));
    harness.run_dispatcher().await;

    for entry in &entries {
        harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    }
    harness.assert_host_status(1, HostStatus::Ready);
}

#[tokio::test]
async fn test_inconsistent_entries_are_reported_on_startup() {
    let config = SchedulerConfig {
        clean_on_startup: true,
        ..Default::default()
    };
    let mut harness = TestHarness::with_config(config);
    harness.db.update_host(1, |h| h.locked = true);
    let entry = harness.create_simple_job(1, 1);
    harness.db.mark_inconsistent(entry.id);

    harness.dispatcher.initialize().await.unwrap();

    assert!(harness.notification_sent("1 queue entries found with active=complete=1"));
}
