//! 运维通知抽象

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// 通知发送端，生产环境写日志，测试中记录下来供断言
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> SchedulerResult<()>;
}
