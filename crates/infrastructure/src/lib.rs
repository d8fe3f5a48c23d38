//! 基础设施层：领域仓储的SQLite实现

pub mod database;

pub use database::*;
