pub mod error;
pub mod persistence;
pub mod queue;
pub mod types;

pub use error::{Result, TaskError};
pub use queue::{TaskContext, TaskHandler, TaskQueue};
pub use types::{TaskInfo, TaskPriority, TaskStatus};
