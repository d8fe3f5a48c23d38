mod common;

use common::TestHarness;
use scheduler_domain::{HostProtection, HostQueueEntryStatus, HostStatus, SpecialTaskKind};
use scheduler_drone::{PidfileContents, Process, AUTOSERV_PID_FILE, PARSER_PID_FILE};
use scheduler_testing_utils::{
    JobBuilder, LabelBuilder, PidfileType, QueueEntryBuilder, FAKE_DRONE_HOSTNAME,
};

fn tasks_of_kind(harness: &TestHarness, kind: SpecialTaskKind) -> usize {
    harness
        .db
        .special_tasks()
        .iter()
        .filter(|t| t.task == kind)
        .count()
}

#[tokio::test]
async fn test_verify_failure_schedules_repair() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;

    // 条目放回队列，保留原主机等待修复
    let requeued = harness.entry(entry.id);
    assert_eq!(requeued.status, HostQueueEntryStatus::Queued);
    assert_eq!(requeued.host_id, Some(1));
    assert_eq!(requeued.execution_subdir, "");
    harness.assert_host_status(1, HostStatus::Repairing);

    let repair = harness
        .db
        .special_tasks()
        .into_iter()
        .find(|t| t.task == SpecialTaskKind::Repair)
        .expect("repair task");
    assert_eq!(repair.queue_entry_id, Some(entry.id));
    assert!(repair.is_active);
}

#[tokio::test]
async fn test_successful_repair_reverifies_entry() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Repair, 0);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Verifying);
    harness.assert_host_status(1, HostStatus::Verifying);
    assert_eq!(tasks_of_kind(&harness, SpecialTaskKind::Verify), 2);
}

#[tokio::test]
async fn test_failed_repair_parses_job_results() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;

    // 修复结果会被复制到作业结果目录，包括autoserv的pidfile
    harness.drone.set_pidfile_contents(
        "1-my_user/host1",
        AUTOSERV_PID_FILE,
        PidfileContents {
            process: Some(Process::new(FAKE_DRONE_HOSTNAME, 4242)),
            exit_status: Some(1),
            num_tests_failed: Some(0),
        },
    );
    harness.drone.finish_process(PidfileType::Repair, 1);
    harness.run_dispatcher().await;

    harness.assert_host_status(1, HostStatus::RepairFailed);
    let entry = harness.entry(entry.id);
    assert_eq!(entry.status, HostQueueEntryStatus::Parsing);
    assert_eq!(entry.execution_subdir, "host1");
    assert!(harness
        .drone
        .was_process_executed("1-my_user/host1", PARSER_PID_FILE));
}

#[tokio::test]
async fn test_failed_repair_without_parse_skips_to_archiving() {
    let mut harness = TestHarness::new();
    let job = JobBuilder::new().with_parse_failed_repair(false).build();
    let entry = harness.create_job(job, &[1]).remove(0);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Repair, 1);
    harness.tick().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Archiving);
    harness.assert_host_status(1, HostStatus::RepairFailed);
}

#[tokio::test]
async fn test_second_verify_failure_fails_entry() {
    let mut harness = TestHarness::new();
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Repair, 0);
    harness.run_dispatcher().await;
    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.tick().await;

    // 修复过一次仍然失败，不再安排新的修复
    harness.assert_host_status(1, HostStatus::RepairFailed);
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Parsing);
    assert_eq!(tasks_of_kind(&harness, SpecialTaskKind::Repair), 1);
}

#[tokio::test]
async fn test_metahost_entry_released_after_failed_verify() {
    let mut harness = TestHarness::new();
    harness.db.insert_label(LabelBuilder::new(1, "label1").build());
    harness.db.add_host_label(1, 1);
    harness.db.add_host_label(2, 1);
    harness.db.insert_job(JobBuilder::new().build());
    let entry = harness
        .db
        .insert_entry(QueueEntryBuilder::new().with_meta_host(1).build());

    harness.run_dispatcher().await;
    assert_eq!(harness.entry(entry.id).host_id, Some(1));

    harness.drone.finish_process(PidfileType::Verify, 1);
    harness.run_dispatcher().await;

    // 元主机条目换一台主机重新验证，原主机进入修复
    let entry = harness.entry(entry.id);
    assert_eq!(entry.host_id, Some(2));
    assert_eq!(entry.status, HostQueueEntryStatus::Verifying);
    harness.assert_host_status(1, HostStatus::Repairing);
    harness.assert_host_status(2, HostStatus::Verifying);
}

#[tokio::test]
async fn test_do_not_verify_host_ignores_verify_failure() {
    let mut harness = TestHarness::new();
    harness
        .db
        .update_host(1, |h| h.protection = HostProtection::DoNotVerify);
    harness.db.update_host(1, |h| h.dirty = true);
    let entry = harness.create_simple_job(1, 1);

    harness.run_dispatcher().await;
    harness.assert_host_status(1, HostStatus::Cleaning);
    harness.drone.finish_process(PidfileType::Cleanup, 1);
    harness.run_dispatcher().await;

    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);
    assert_eq!(tasks_of_kind(&harness, SpecialTaskKind::Repair), 0);
}
