mod common;

use common::TestHarness;
use scheduler_core::SchedulerConfig;
use scheduler_testing_utils::PidfileType;

#[tokio::test]
async fn test_drone_capacity_limits_started_processes() {
    let mut harness = TestHarness::new();
    harness.drone.set_process_capacity(3);
    for id in 1..=4 {
        harness.create_simple_job(id, id);
    }

    harness.tick().await;
    assert_eq!(harness.drone.executed_commands().len(), 3);
    assert_eq!(harness.dispatcher.agents().len(), 4);

    harness.drone.finish_process(PidfileType::Verify, 0);
    harness.tick().await;
    assert_eq!(harness.drone.executed_commands().len(), 4);
}

#[tokio::test]
async fn test_max_processes_started_per_cycle() {
    let config = SchedulerConfig {
        max_processes_started_per_cycle: 2,
        ..Default::default()
    };
    let mut harness = TestHarness::with_config(config);
    for id in 1..=3 {
        harness.create_simple_job(id, id);
    }

    harness.tick().await;
    assert_eq!(harness.drone.executed_commands().len(), 2);

    harness.tick().await;
    assert_eq!(harness.drone.executed_commands().len(), 3);
}
