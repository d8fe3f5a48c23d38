use serde::{Deserialize, Serialize};

/// 单个执行机（drone）的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneConfig {
    pub hostname: String,
    /// 该drone上允许同时运行的进程数
    pub max_processes: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_processes: 1000,
            enabled: true,
        }
    }
}

impl DroneConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hostname.is_empty() {
            return Err(anyhow::anyhow!("Drone主机名不能为空"));
        }
        Ok(())
    }
}
