pub mod manager;
pub mod mapping;
pub mod schema;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use schema::run_migrations;
pub use sqlite::*;
