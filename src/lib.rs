//! 实验室调度器的应用外壳：配置加载之后的组装、日志与指标初始化、关闭信号

pub mod app;
pub mod observability;
pub mod shutdown;
