use std::net::SocketAddr;

use anyhow::{Context, Result};
use scheduler_core::{LogFormat, ObservabilityConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，RUST_LOG 优先于配置的日志级别
pub fn init_logging(log_level: &str, log_format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}

/// 按配置启动Prometheus导出器
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let address: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("启动Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出器监听 {}", address);
    Ok(())
}

pub fn parse_log_format(value: &str) -> Result<LogFormat> {
    match value {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        other => Err(anyhow::anyhow!("不支持的日志格式: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("pretty").unwrap(), LogFormat::Pretty);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_metrics_disabled_is_noop() {
        let config = ObservabilityConfig {
            metrics_enabled: false,
            metrics_bind_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(init_metrics(&config).is_ok());
    }
}
