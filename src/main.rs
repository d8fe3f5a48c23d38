use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use lab_scheduler::app::{Application, RunOptions};
use lab_scheduler::observability::{init_logging, init_metrics, parse_log_format};
use lab_scheduler::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use scheduler_core::AppConfig;
use tracing::{error, info, warn};

fn cli() -> Command {
    Command::new("lab-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("实验室测试任务调度器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径搜索"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("执行恢复和一次tick后退出")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-recovery")
                .long("no-recovery")
                .help("跳过启动恢复")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("<默认路径>")
        )
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = parse_log_format(format)?;
    }
    init_logging(&config.observability.log_level, config.observability.log_format)?;
    init_metrics(&config.observability)?;

    let options = RunOptions {
        recover: !matches.get_flag("no-recovery"),
        once: matches.get_flag("once"),
    };
    info!("启动实验室调度器 {:?}", options);

    let mut app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe().await;

    let app_handle = tokio::spawn(async move { app.run(options, shutdown_rx).await });

    if !options.once {
        let signal_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!("安装信号处理器失败: {}", e);
            }
            signal_manager.shutdown().await;
        });
    }

    match app_handle.await {
        Ok(Ok(())) => info!("调度器已退出"),
        Ok(Err(e)) => {
            error!("调度器异常退出: {:#}", e);
            return Err(e);
        }
        Err(e) => {
            warn!("调度任务异常终止: {}", e);
            return Err(e).context("调度任务异常终止");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let matches = cli()
            .try_get_matches_from(["lab-scheduler", "--once", "--no-recovery", "-l", "debug"])
            .unwrap();
        assert!(matches.get_flag("once"));
        assert!(matches.get_flag("no-recovery"));
        assert_eq!(matches.get_one::<String>("log-level").unwrap(), "debug");
        assert!(matches.get_one::<String>("config").is_none());
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(cli()
            .try_get_matches_from(["lab-scheduler", "--log-format", "xml"])
            .is_err());
    }
}
