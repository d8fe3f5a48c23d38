use anyhow::Result;
use lab_scheduler::app::{Application, RunOptions};
use lab_scheduler::shutdown::ShutdownManager;
use scheduler_core::AppConfig;
use std::time::Duration;
use tokio::time::timeout;

fn test_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}", dir.path().join("scheduler.db").display());
    config.scheduler.results_dir = dir.path().join("results").display().to_string();
    config.scheduler.tick_pause_secs = 1;
    config
}

#[tokio::test]
async fn test_single_tick_on_empty_database() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut app = Application::new(test_config(&dir)).await?;
    let shutdown = ShutdownManager::new();

    let options = RunOptions {
        recover: true,
        once: true,
    };
    app.run(options, shutdown.subscribe().await).await?;

    assert_eq!(app.dispatcher().tick_count(), 1);
    assert!(app.dispatcher().agents().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_loop_stops_on_shutdown_signal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut app = Application::new(test_config(&dir)).await?;
    let shutdown = ShutdownManager::new();
    let rx = shutdown.subscribe().await;

    let handle = tokio::spawn(async move {
        app.run(RunOptions::default(), rx).await?;
        Ok::<_, anyhow::Error>(app.dispatcher().tick_count())
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.shutdown().await;

    let ticks = timeout(Duration::from_secs(5), handle).await???;
    assert!(ticks >= 1);
    Ok(())
}

#[tokio::test]
async fn test_invalid_database_url_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.database.url = format!("sqlite://{}/missing/dir/db.sqlite", dir.path().display());

    assert!(Application::new(config).await.is_err());
}
