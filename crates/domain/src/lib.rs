pub mod entities;
pub mod notifications;
pub mod repositories;
pub mod value_objects;

pub use entities::*;
pub use notifications::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
pub use value_objects::*;
