mod item;
mod lifecycle;
mod status;

pub use item::{ClaimFields, CompletedFields, ExecutionResult, NewWorkItem, PaidFields, WorkItem};
pub use lifecycle::WorkItemLifecycle;
pub use status::{UnknownStatus, WorkStatus};
