pub mod sqlite_acl_repository;
pub mod sqlite_host_queue_entry_repository;
pub mod sqlite_host_repository;
pub mod sqlite_ineligible_host_repository;
pub mod sqlite_job_repository;
pub mod sqlite_label_repository;
pub mod sqlite_special_task_repository;

pub use sqlite_acl_repository::SqliteAclRepository;
pub use sqlite_host_queue_entry_repository::SqliteHostQueueEntryRepository;
pub use sqlite_host_repository::SqliteHostRepository;
pub use sqlite_ineligible_host_repository::SqliteIneligibleHostRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_label_repository::SqliteLabelRepository;
pub use sqlite_special_task_repository::SqliteSpecialTaskRepository;
