mod common;

use common::TestHarness;
use scheduler_domain::{HostQueueEntryStatus, HostStatus, SpecialTaskKind};
use scheduler_drone::CRASHINFO_PID_FILE;
use scheduler_testing_utils::{JobBuilder, PidfileType};

#[tokio::test]
async fn test_abort_during_verify_cleans_host() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Verifying);

    harness.db.abort_job(1);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    assert!(harness.drone.was_last_process_killed(PidfileType::Verify));
    harness.assert_host_status(1, HostStatus::Cleaning);

    let tasks = harness.db.special_tasks();
    let verify = tasks
        .iter()
        .find(|t| t.task == SpecialTaskKind::Verify)
        .expect("verify task");
    assert!(verify.is_complete);
    assert!(!verify.success);
    let cleanup = tasks
        .iter()
        .find(|t| t.task == SpecialTaskKind::Cleanup)
        .expect("cleanup task");
    assert!(cleanup.is_active);
    assert_eq!(cleanup.queue_entry_id, None);
}

#[tokio::test]
async fn test_abort_running_job_gathers_crashinfo() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_run_verify(false).build();
    let entry = harness.create_job(job, &[1]).remove(0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);

    harness.db.abort_job(1);
    harness.run_dispatcher().await;

    assert!(harness.drone.was_last_process_killed(PidfileType::Job));
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Gathering);
    // 被信号终止的autoserv需要收集崩溃信息
    assert!(harness
        .drone
        .was_process_executed("1-my_user/host1", CRASHINFO_PID_FILE));
    let keyvals = harness.drone.written_lines("1-my_user/host1/keyval");
    assert!(keyvals.iter().any(|l| l == "aborted_by=autotest_system"));

    harness.drone.finish_process(PidfileType::Gather, 0);
    harness.run_dispatcher().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);
    harness.drone.finish_process(PidfileType::Parse, 0);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Archive, 0);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    // 中止的作业总是清理主机
    harness.assert_host_status(1, HostStatus::Cleaning);
}

#[tokio::test]
async fn test_abort_before_agent_starts() {
    let mut harness = TestHarness::new();
    harness.drone.set_process_capacity(0);
    let entry = harness.create_simple_job(1, 1);
    harness.tick().await;
    assert_eq!(harness.dispatcher.agents().len(), 1);

    harness.db.abort_job(1);
    harness.run_dispatcher().await;

    assert!(harness.drone.executed_commands().is_empty());
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    let verify = harness
        .db
        .special_tasks()
        .into_iter()
        .find(|t| t.task == SpecialTaskKind::Verify)
        .expect("verify task");
    assert!(verify.is_complete);
    assert!(!verify.success);
}

#[tokio::test]
async fn test_abort_queued_entry() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);
    harness.db.abort_job(1);

    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Aborted);
    harness.assert_host_status(1, HostStatus::Ready);
    assert!(harness.db.special_tasks().is_empty());
    assert!(harness.drone.executed_commands().is_empty());
}

#[tokio::test]
async fn test_abort_stops_remaining_synchronous_entries() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_synch_count(2).build();
    let entries = harness.create_job(job, &[1, 2]);
    harness.run_dispatcher().await;

    harness.db.update_entry(entries[0].id, |e| e.aborted = true);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entries[0].id, HostQueueEntryStatus::Aborted);
    // 剩下的条目凑不齐 synch_count，不能继续
    let other = harness.entry(entries[1].id);
    assert_ne!(other.status, HostQueueEntryStatus::Running);
    assert!(harness
        .drone
        .executed_commands()
        .iter()
        .all(|r| r.working_directory.starts_with("hosts/")));
}
