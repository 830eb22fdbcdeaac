pub mod app;
pub mod config;
pub mod error;
pub mod fetch;
pub mod scheduler;

pub use error::{AppError, Result, SchedulerError};
pub use scheduler::{PendingFetch, RequestKind, Scheduler, SubmitOptions};
