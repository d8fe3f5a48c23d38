use serde::{Deserialize, Serialize};

/// 运维通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// 通知收件地址，仅用于日志记录
    pub admin_address: String,
    pub subject_prefix: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_address: "lab-admin@localhost".to_string(),
            subject_prefix: "[lab-scheduler]".to_string(),
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.admin_address.is_empty() {
            return Err(anyhow::anyhow!("启用通知时收件地址不能为空"));
        }
        Ok(())
    }
}
