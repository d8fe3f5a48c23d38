//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the lab scheduler workspace.
//!
//! ## Features
//!
//! - **MockDatabase**: 实现全部仓储trait的内存数据库
//! - **FakeDroneManager**: 可由测试驱动的drone，进程只有在测试调用 `finish_process` 后才结束
//! - **ManualClock**: 手动推进的时钟
//! - **RecordingNotificationSink**: 记录所有发出的运维通知
//! - **Builders**: 带有合理默认值的实体构建器
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
