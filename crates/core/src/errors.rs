use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("队列条目未找到: {id}")]
    QueueEntryNotFound { id: i64 },

    #[error("主机未找到: {id}")]
    HostNotFound { id: i64 },

    #[error("特殊任务未找到: {id}")]
    SpecialTaskNotFound { id: i64 },

    #[error("原子组未找到: {id}")]
    AtomicGroupNotFound { id: i64 },

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("无效的pidfile {path}: {message}")]
    InvalidPidfile { path: String, message: String },

    #[error("Drone错误: {0}")]
    Drone(String),

    #[error("恢复失败: {0}")]
    Recovery(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn drone_error<S: Into<String>>(msg: S) -> Self {
        Self::Drone(msg.into())
    }

    pub fn recovery_error<S: Into<String>>(msg: S) -> Self {
        Self::Recovery(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 致命错误会终止调度主循环，其余错误只影响单个Agent或单次tick
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Recovery(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::DatabaseOperation(_) | Self::Drone(_) | Self::Io(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SchedulerError::recovery_error("verifying entry without task").is_fatal());
        assert!(SchedulerError::config_error("bad").is_fatal());
        assert!(!SchedulerError::JobNotFound { id: 1 }.is_fatal());
        assert!(!SchedulerError::invalid_state("x").is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SchedulerError::drone_error("drone down").is_retryable());
        assert!(SchedulerError::DatabaseOperation("locked".into()).is_retryable());
        assert!(!SchedulerError::internal("bug").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidPidfile {
            path: "1-user/host1/.autoserv_execute".into(),
            message: "too many lines".into(),
        };
        let text = err.to_string();
        assert!(text.contains(".autoserv_execute"));
        assert!(text.contains("too many lines"));
    }
}
