//! 调度器配置
//!
//! 配置按以下顺序合并：
//!
//! 1. 内置默认值
//! 2. TOML配置文件（显式路径或默认搜索路径）
//! 3. 环境变量覆盖（前缀 `SCHEDULER_`，层级分隔符 `__`）
//!
//! 合并后的配置在返回前会执行 `validate()`。

pub mod models;

pub use models::*;
