pub mod app_config;
pub mod database;
pub mod drones;
pub mod notifications;
pub mod observability;
pub mod scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use drones::DroneConfig;
pub use notifications::NotificationConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use scheduler::SchedulerConfig;
