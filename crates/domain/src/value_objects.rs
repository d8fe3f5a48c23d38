//! 值对象：持久化为固定字符串的状态与策略枚举
//!
//! 这些字符串是对外契约的一部分（报表与UI直接读取），不可随意修改。

use scheduler_core::SchedulerError;
use serde::{Deserialize, Serialize};

/// 为持久化为字符串的枚举生成 `as_str`/`FromStr`/`Display` 以及SQLite编解码
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = SchedulerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SchedulerError::invalid_state(format!(
                        "无效的{}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$name>().map_err(|e| e.to_string().into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }
    };
}

text_enum! {
    /// 作业优先级
    Priority {
        Low => "Low",
        Medium => "Medium",
        High => "High",
        Urgent => "Urgent",
    }
}

impl Priority {
    /// 数值越大优先级越高
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }
}

text_enum! {
    /// 队列条目（HQE）状态
    HostQueueEntryStatus {
        Queued => "Queued",
        Verifying => "Verifying",
        Pending => "Pending",
        Waiting => "Waiting",
        Starting => "Starting",
        Running => "Running",
        Gathering => "Gathering",
        Parsing => "Parsing",
        Archiving => "Archiving",
        Aborted => "Aborted",
        Completed => "Completed",
        Failed => "Failed",
        Stopped => "Stopped",
        Template => "Template",
    }
}

/// 由状态推导出的 (active, complete) 标志
///
/// 这是唯一计算这两个标志的地方，所有状态写入都持久化它的结果。
pub fn derive_flags(status: HostQueueEntryStatus) -> (bool, bool) {
    use HostQueueEntryStatus::*;
    match status {
        Queued => (false, false),
        Verifying | Pending | Waiting | Starting | Running | Gathering | Parsing | Archiving => {
            (true, false)
        }
        Aborted | Completed | Failed | Stopped | Template => (false, true),
    }
}

impl HostQueueEntryStatus {
    pub fn is_active(&self) -> bool {
        derive_flags(*self).0
    }

    pub fn is_complete(&self) -> bool {
        derive_flags(*self).1
    }

    /// 作业已被某个进程占用（用于原子组“只运行一次”的判断）
    pub fn is_started(&self) -> bool {
        matches!(
            self,
            HostQueueEntryStatus::Starting
                | HostQueueEntryStatus::Running
                | HostQueueEntryStatus::Completed
        )
    }
}

text_enum! {
    /// 主机状态
    HostStatus {
        Ready => "Ready",
        Running => "Running",
        Verifying => "Verifying",
        Repairing => "Repairing",
        RepairFailed => "Repair Failed",
        Cleaning => "Cleaning",
        Pending => "Pending",
    }
}

text_enum! {
    /// 主机保护级别，决定修复的激进程度
    HostProtection {
        NoProtection => "No protection",
        RepairSoftwareOnly => "Repair software only",
        RepairFilesystemOnly => "Repair filesystem only",
        DoNotRepair => "Do not repair",
        DoNotVerify => "Do not verify",
    }
}

impl HostProtection {
    /// autoserv `--host-protection` 参数使用的名称
    pub fn attr_name(&self) -> &'static str {
        match self {
            HostProtection::NoProtection => "NO_PROTECTION",
            HostProtection::RepairSoftwareOnly => "REPAIR_SOFTWARE_ONLY",
            HostProtection::RepairFilesystemOnly => "REPAIR_FILESYSTEM_ONLY",
            HostProtection::DoNotRepair => "DO_NOT_REPAIR",
            HostProtection::DoNotVerify => "DO_NOT_VERIFY",
        }
    }
}

text_enum! {
    RebootBefore {
        Never => "Never",
        IfDirty => "If dirty",
        Always => "Always",
    }
}

text_enum! {
    RebootAfter {
        Never => "Never",
        IfAllTestsPassed => "If all tests passed",
        Always => "Always",
    }
}

text_enum! {
    /// 特殊任务类型
    SpecialTaskKind {
        Verify => "Verify",
        Cleanup => "Cleanup",
        Repair => "Repair",
    }
}

impl SpecialTaskKind {
    /// 同一主机上多个排队任务的执行优先级，数值越小越先执行
    pub fn schedule_order(&self) -> u8 {
        match self {
            SpecialTaskKind::Repair => 0,
            SpecialTaskKind::Cleanup => 1,
            SpecialTaskKind::Verify => 2,
        }
    }

    pub fn dir_suffix(&self) -> &'static str {
        match self {
            SpecialTaskKind::Verify => "verify",
            SpecialTaskKind::Cleanup => "cleanup",
            SpecialTaskKind::Repair => "repair",
        }
    }
}
