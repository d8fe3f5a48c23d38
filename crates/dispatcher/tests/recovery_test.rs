mod common;

use common::TestHarness;
use scheduler_core::{SchedulerConfig, SchedulerError};
use scheduler_domain::{HostQueueEntryStatus, HostStatus, SpecialTaskKind};
use scheduler_drone::{PidfileContents, Process, AUTOSERV_PID_FILE, PARSER_PID_FILE};
use scheduler_testing_utils::{
    FakeDroneManager, MockDatabase, QueueEntryBuilder, SpecialTaskBuilder, FAKE_DRONE_HOSTNAME,
};

fn running_process(pid: u32) -> PidfileContents {
    PidfileContents {
        process: Some(Process::new(FAKE_DRONE_HOSTNAME, pid)),
        exit_status: None,
        num_tests_failed: None,
    }
}

/// 上次运行留下一个 Running 条目
fn harness_with_running_entry(config: SchedulerConfig, drone: FakeDroneManager) -> (TestHarness, i64) {
    let harness = TestHarness::build(config, MockDatabase::new(), drone);
    harness.db.insert_job(scheduler_testing_utils::JobBuilder::new().build());
    let entry = harness.db.insert_entry(
        QueueEntryBuilder::new()
            .with_host(1)
            .with_status(HostQueueEntryStatus::Running)
            .with_execution_subdir("host1")
            .with_started_on(scheduler_testing_utils::test_epoch())
            .build(),
    );
    harness.db.update_host(1, |h| h.status = HostStatus::Running);
    (harness, entry.id)
}

#[tokio::test]
async fn test_recover_running_process() {
    let drone = FakeDroneManager::new().with_orphans(vec![
        Process::new(FAKE_DRONE_HOSTNAME, 1234),
        Process::new(FAKE_DRONE_HOSTNAME, 9999),
    ]);
    let (mut harness, entry_id) = harness_with_running_entry(SchedulerConfig::default(), drone);
    harness
        .drone
        .set_pidfile_contents("1-my_user/host1", AUTOSERV_PID_FILE, running_process(1234));

    harness.dispatcher.initialize().await.unwrap();

    let agents = harness.dispatcher.agents();
    assert_eq!(agents.len(), 1);
    assert!(agents[0].is_started());
    assert!(harness.drone.executed_commands().is_empty());
    // 9999 没有对应的条目
    assert!(harness.notification_sent("Unrecovered orphan autoserv processes remain"));

    harness.tick().await;
    harness.assert_entry_status(entry_id, HostQueueEntryStatus::Running);
    assert!(harness.drone.executed_commands().is_empty());

    harness
        .drone
        .finish_specific_process("1-my_user/host1", AUTOSERV_PID_FILE);
    harness.tick().await;
    harness.assert_entry_status(entry_id, HostQueueEntryStatus::Gathering);
}

#[tokio::test]
async fn test_running_entry_without_process_is_restarted() {
    let (mut harness, entry_id) =
        harness_with_running_entry(SchedulerConfig::default(), FakeDroneManager::new());

    harness.dispatcher.initialize().await.unwrap();
    assert!(harness.drone.executed_commands().is_empty());

    harness.tick().await;
    harness.assert_entry_status(entry_id, HostQueueEntryStatus::Running);
    assert!(harness
        .drone
        .was_process_executed("1-my_user/host1", AUTOSERV_PID_FILE));
    assert!(!harness.notification_sent("orphan"));
}

#[tokio::test]
async fn test_die_on_orphans() {
    let config = SchedulerConfig {
        die_on_orphans: true,
        ..Default::default()
    };
    let drone =
        FakeDroneManager::new().with_orphans(vec![Process::new(FAKE_DRONE_HOSTNAME, 5555)]);
    let mut harness = TestHarness::build(config, MockDatabase::new(), drone);

    let result = harness.dispatcher.initialize().await;
    assert!(matches!(result, Err(SchedulerError::Recovery(_))));
}

#[tokio::test]
async fn test_unrecovered_verifying_entry_is_fatal() {
    let mut harness = TestHarness::new();
    harness
        .db
        .insert_job(scheduler_testing_utils::JobBuilder::new().build());
    harness.db.insert_entry(
        QueueEntryBuilder::new()
            .with_host(1)
            .with_status(HostQueueEntryStatus::Verifying)
            .build(),
    );

    let result = harness.dispatcher.initialize().await;
    match result {
        Err(SchedulerError::Recovery(message)) => {
            assert!(message.starts_with("1 unrecovered verifying host queue entries"));
        }
        other => panic!("expected recovery error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_verifying_entry_with_queued_verify_recovers() {
    let mut harness = TestHarness::new();
    harness
        .db
        .insert_job(scheduler_testing_utils::JobBuilder::new().build());
    let entry = harness.db.insert_entry(
        QueueEntryBuilder::new()
            .with_host(1)
            .with_status(HostQueueEntryStatus::Verifying)
            .build(),
    );
    harness.db.update_host(1, |h| h.status = HostStatus::Verifying);
    harness.db.insert_special_task(
        SpecialTaskBuilder::new(1, SpecialTaskKind::Verify)
            .with_queue_entry(entry.id)
            .build(),
    );

    harness.dispatcher.initialize().await.unwrap();
    // 已经有排队的验证任务，不再安排清理
    assert_eq!(harness.db.special_tasks().len(), 1);

    harness.tick().await;
    assert!(harness.db.special_tasks()[0].is_active);
}

#[tokio::test]
async fn test_pending_entry_is_started() {
    let mut harness = TestHarness::new();
    harness
        .db
        .insert_job(scheduler_testing_utils::JobBuilder::new().build());
    let entry = harness.db.insert_entry(
        QueueEntryBuilder::new()
            .with_host(1)
            .with_status(HostQueueEntryStatus::Pending)
            .build(),
    );
    harness.db.update_host(1, |h| h.status = HostStatus::Pending);

    harness.dispatcher.initialize().await.unwrap();
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Starting);

    harness.tick().await;
    harness.assert_entry_status(entry.id, HostQueueEntryStatus::Running);
}

#[tokio::test]
async fn test_repair_failed_host_is_reverified() {
    let mut harness = TestHarness::new();
    harness
        .db
        .update_host(1, |h| h.status = HostStatus::RepairFailed);

    harness.dispatcher.initialize().await.unwrap();

    let tasks = harness.db.special_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task, SpecialTaskKind::Cleanup);
    assert_eq!(tasks[0].host_id, 1);
    assert!(harness.notification_sent("Host host1 is in Repair Failed state"));
}

#[tokio::test]
async fn test_repair_failed_host_left_alone_when_disabled() {
    let config = SchedulerConfig {
        reverify_repair_failed_hosts: false,
        ..Default::default()
    };
    let mut harness = TestHarness::with_config(config);
    harness
        .db
        .update_host(1, |h| h.status = HostStatus::RepairFailed);

    harness.dispatcher.initialize().await.unwrap();

    assert!(harness.db.special_tasks().is_empty());
    assert!(harness.sink.sent().is_empty());
}

#[tokio::test]
async fn test_host_stuck_verifying_is_cleaned() {
    let mut harness = TestHarness::new();
    harness.db.update_host(2, |h| h.status = HostStatus::Verifying);
    harness.db.update_host(3, |h| {
        h.status = HostStatus::Cleaning;
        h.locked = true;
    });

    harness.dispatcher.initialize().await.unwrap();

    let tasks = harness.db.special_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].host_id, 2);
    assert_eq!(tasks[0].task, SpecialTaskKind::Cleanup);
    // 这种情况不发通知
    assert!(harness.sink.sent().is_empty());

    harness.tick().await;
    harness.assert_host_status(2, HostStatus::Cleaning);
}

#[tokio::test]
async fn test_recover_active_special_task() {
    let mut harness = TestHarness::new();
    harness.db.update_host(1, |h| h.status = HostStatus::Verifying);
    let task = harness
        .db
        .insert_special_task(SpecialTaskBuilder::new(1, SpecialTaskKind::Verify).active().build());
    let working_directory = task.execution_path("host1");
    harness
        .drone
        .set_pidfile_contents(&working_directory, AUTOSERV_PID_FILE, running_process(2345));

    harness.dispatcher.initialize().await.unwrap();

    assert_eq!(harness.dispatcher.agents().len(), 1);
    assert!(harness.dispatcher.agents()[0].is_started());
    assert!(harness.drone.executed_commands().is_empty());
    assert_eq!(harness.db.special_tasks().len(), 1);

    harness
        .drone
        .finish_specific_process(&working_directory, AUTOSERV_PID_FILE);
    harness.tick().await;

    harness.assert_host_status(1, HostStatus::Ready);
    let task = &harness.db.special_tasks()[0];
    assert!(task.is_complete);
    assert!(task.success);
}

#[tokio::test]
async fn test_recovered_parse_without_autoserv_results_fails() {
    let mut harness = TestHarness::new();
    harness.db.insert_job(scheduler_testing_utils::JobBuilder::new().build());
    harness.db.insert_entry(
        QueueEntryBuilder::new()
            .with_host(1)
            .with_status(HostQueueEntryStatus::Parsing)
            .with_execution_subdir("host1")
            .build(),
    );

    harness.dispatcher.initialize().await.unwrap();
    harness.tick().await;

    assert!(harness.notification_sent("No paired results in task"));
    assert!(!harness
        .drone
        .was_process_executed("1-my_user/host1", PARSER_PID_FILE));
}
