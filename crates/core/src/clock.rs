//! 时钟抽象
//!
//! 调度逻辑中的所有超时判断（pidfile超时、延迟回调、周期清理）都通过
//! `Clock` 读取当前时间，测试中可以替换为手动推进的时钟。

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
