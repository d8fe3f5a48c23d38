mod common;

use common::TestHarness;
use scheduler_domain::{HostQueueEntryStatus, HostStatus, RebootAfter, SpecialTaskKind};
use scheduler_drone::{AUTOSERV_PID_FILE, CRASHINFO_PID_FILE, PARSER_PID_FILE};
use scheduler_testing_utils::{JobBuilder, PidfileType, QueueEntryBuilder};

#[tokio::test]
async fn test_simple_job_runs_through_every_stage() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Verifying);
    harness.assert_host_status(1, HostStatus::Verifying);

    harness.drone.finish_process(PidfileType::Verify, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);
    harness.assert_host_status(1, HostStatus::Running);
    assert_eq!(harness.entry(entry.id).execution_subdir, "host1");
    assert!(harness.host(1).dirty);
    assert!(harness
        .drone
        .was_process_executed("1-my_user/host1", AUTOSERV_PID_FILE));

    harness.drone.finish_process(PidfileType::Job, 0);
    harness.run_dispatcher().await;
    // 清理要等条目完成之后才能占用主机
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);
    harness.assert_host_status(1, HostStatus::Running);
    let cleanup = harness
        .db
        .special_tasks()
        .into_iter()
        .find(|t| t.task == SpecialTaskKind::Cleanup)
        .expect("post-job cleanup");
    assert!(cleanup.is_queued());
    assert_eq!(cleanup.queue_entry_id, None);
    assert_eq!(cleanup.requested_by.as_deref(), Some("my_user"));

    harness.drone.finish_process(PidfileType::Parse, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Archiving);

    harness.drone.finish_process(PidfileType::Archive, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Completed);
    harness.assert_host_status(1, HostStatus::Cleaning);

    harness.drone.finish_process(PidfileType::Cleanup, 0);
    harness.run_dispatcher().await;
    harness.assert_host_status(1, HostStatus::Ready);
    assert!(!harness.host(1).dirty);
    assert!(harness
        .db
        .special_tasks()
        .iter()
        .all(|t| t.is_complete && t.success));
}

#[tokio::test]
async fn test_dirty_host_is_cleaned_before_verify() {
    let mut harness = TestHarness::new();
    harness.db.update_host(1, |h| h.dirty = true);
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Verifying);
    harness.assert_host_status(1, HostStatus::Cleaning);

    harness.drone.finish_process(PidfileType::Cleanup, 0);
    harness.run_dispatcher().await;
    harness.assert_host_status(1, HostStatus::Verifying);
    assert!(!harness.host(1).dirty);

    let kinds: Vec<SpecialTaskKind> = harness.db.special_tasks().iter().map(|t| t.task).collect();
    assert_eq!(kinds, vec![SpecialTaskKind::Cleanup, SpecialTaskKind::Verify]);
}

#[tokio::test]
async fn test_job_without_verify_starts_immediately() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_run_verify(false).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.tick().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);
    assert!(harness.db.special_tasks().is_empty());
    assert!(harness.entry(entry.id).started_on.is_some());
}

#[tokio::test]
async fn test_reboot_after_never_releases_host() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new()
        .with_run_verify(false)
        .with_reboot_after(RebootAfter::Never)
        .build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Job, 0);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);
    harness.assert_host_status(1, HostStatus::Ready);
    assert!(harness.db.special_tasks().is_empty());
}

#[tokio::test]
async fn test_failed_job_ends_failed() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_run_verify(false).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.run_dispatcher().await;
    // 等待状态256：正常退出，退出码1
    harness.drone.finish_process(PidfileType::Job, 256);
    harness.run_dispatcher().await;
    assert!(!harness
        .drone
        .was_process_executed("1-my_user/host1", CRASHINFO_PID_FILE));
    harness.drone.finish_process(PidfileType::Parse, 0);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Archive, 0);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Failed);
}

#[tokio::test]
async fn test_signalled_job_collects_crashinfo() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_run_verify(false).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.run_dispatcher().await;
    // SIGKILL
    harness.drone.finish_process(PidfileType::Job, 9);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Gathering);
    assert!(harness
        .drone
        .was_process_executed("1-my_user/host1", CRASHINFO_PID_FILE));

    harness.drone.finish_process(PidfileType::Gather, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);

    harness.drone.finish_process(PidfileType::Parse, 0);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Archive, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Failed);
}

#[tokio::test]
async fn test_synchronous_job_runs_in_group_directory() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new()
        .with_synch_count(2)
        .with_run_verify(false)
        .build();
    let entries = harness.create_job(job, &[1, 2]);

    harness.run_dispatcher().await;

    for entry in &entries {
        let entry = harness.entry(entry.id);
        assert_eq!(entry.status, HostQueueEntryStatus::Running);
        assert_eq!(entry.execution_subdir, "group0");
    }
    let commands = harness.drone.executed_commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].working_directory, "1-my_user/group0");
    assert_eq!(commands[0].num_processes, 2);
    assert!(commands[0].command.iter().any(|arg| arg == "host1,host2"));
}

#[tokio::test]
async fn test_hostless_job_runs_on_server() {
    let mut harness = TestHarness::new();
    harness.db.insert_job(JobBuilder::new().build());
    let entry = harness.db.insert_entry(QueueEntryBuilder::new().build());

    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);
    assert_eq!(harness.entry(entry.id).execution_subdir, "hostless");
    assert!(harness
        .drone
        .was_process_executed("1-my_user/hostless", AUTOSERV_PID_FILE));

    harness.drone.finish_process(PidfileType::Job, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);
    assert!(harness
        .drone
        .was_process_executed("1-my_user/hostless", PARSER_PID_FILE));
}

#[tokio::test]
async fn test_parse_throttle_limits_concurrent_parsers() {
    let config = scheduler_core::SchedulerConfig {
        max_parse_processes: 1,
        ..Default::default()
    };
    let mut harness = TestHarness::with_config(config);
    for job_id in 1..=2 {
        let job = JobBuilder::new()
            .with_id(job_id)
            .with_run_verify(false)
            .with_reboot_after(RebootAfter::Never)
            .build();
        harness.create_job(job, &[job_id]);
    }

    harness.run_dispatcher().await;
    harness
        .drone
        .finish_specific_process("1-my_user/host1", AUTOSERV_PID_FILE);
    harness
        .drone
        .finish_specific_process("2-my_user/host2", AUTOSERV_PID_FILE);
    harness.run_dispatcher().await;

    let parsers = harness
        .drone
        .executed_commands()
        .into_iter()
        .filter(|r| r.pidfile_name == PARSER_PID_FILE)
        .count();
    assert_eq!(parsers, 1);

    harness.drone.finish_process(PidfileType::Parse, 0);
    harness.run_dispatcher().await;
    let parsers = harness
        .drone
        .executed_commands()
        .into_iter()
        .filter(|r| r.pidfile_name == PARSER_PID_FILE)
        .count();
    assert_eq!(parsers, 2);
}
