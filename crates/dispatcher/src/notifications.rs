//! 运维通知队列
//!
//! 调度过程中发现的异常（进程丢失、孤儿进程、不一致的中止状态等）先排队，
//! 每个tick结束时统一发送，避免在状态推进的中途阻塞。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scheduler_core::{Clock, NotificationConfig, SchedulerResult};
use scheduler_domain::{Notification, NotificationSink};
use tracing::{debug, error, warn};

pub struct EmailManager {
    sink: Arc<dyn NotificationSink>,
    config: NotificationConfig,
    clock: Arc<dyn Clock>,
    queue: Mutex<Vec<Notification>>,
    footer: String,
}

impl EmailManager {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        config: NotificationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let server = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            sink,
            config,
            clock,
            queue: Mutex::new(Vec::new()),
            footer: format!("\n\nReport from lab-scheduler on {server}"),
        }
    }

    /// 排队一条发给管理员的通知，在 `send_queued` 时发出
    pub fn enqueue_admin(&self, subject: &str, body: &str) {
        let notification = Notification {
            subject: subject.to_string(),
            body: format!("{body}{}", self.footer),
            created_at: self.clock.now(),
        };
        self.lock_queue().push(notification);
    }

    pub fn queued_count(&self) -> usize {
        self.lock_queue().len()
    }

    pub async fn send_queued(&self) -> SchedulerResult<()> {
        let pending: Vec<Notification> = self.lock_queue().drain(..).collect();
        if pending.is_empty() {
            return Ok(());
        }

        if !self.config.enabled {
            debug!("通知已禁用，丢弃 {} 条通知", pending.len());
            return Ok(());
        }

        for mut notification in pending {
            if !self.config.subject_prefix.is_empty() {
                notification.subject =
                    format!("{} {}", self.config.subject_prefix, notification.subject);
            }
            if let Err(e) = self.sink.send(&notification).await {
                error!("发送通知 {:?} 失败: {}", notification.subject, e);
            }
        }
        Ok(())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 生产环境的通知出口：写入日志，由日志系统负责告警
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink {
    admin_address: String,
}

impl LogNotificationSink {
    pub fn new(admin_address: impl Into<String>) -> Self {
        Self {
            admin_address: admin_address.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send(&self, notification: &Notification) -> SchedulerResult<()> {
        warn!(
            to = %self.admin_address,
            subject = %notification.subject,
            "运维通知: {}",
            notification.body
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_testing_utils::{ManualClock, RecordingNotificationSink};

    fn manager(enabled: bool) -> (EmailManager, Arc<RecordingNotificationSink>) {
        let sink = Arc::new(RecordingNotificationSink::new());
        let config = NotificationConfig {
            enabled,
            admin_address: "admin@lab".to_string(),
            subject_prefix: "[sched]".to_string(),
        };
        let manager = EmailManager::new(sink.clone(), config, Arc::new(ManualClock::default()));
        (manager, sink)
    }

    #[tokio::test]
    async fn test_queued_notifications_sent_with_prefix() {
        let (manager, sink) = manager(true);
        manager.enqueue_admin("Pidfile error", "details");
        assert_eq!(manager.queued_count(), 1);
        assert!(sink.sent().is_empty());

        manager.send_queued().await.unwrap();
        assert_eq!(sink.subjects(), vec!["[sched] Pidfile error".to_string()]);
        assert!(sink.sent()[0].body.starts_with("details"));
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_notifications_are_dropped() {
        let (manager, sink) = manager(false);
        manager.enqueue_admin("subject", "body");
        manager.send_queued().await.unwrap();
        assert!(sink.sent().is_empty());
        assert_eq!(manager.queued_count(), 0);
    }
}
