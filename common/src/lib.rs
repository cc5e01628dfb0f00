pub mod api;
pub mod job;
pub mod results;
pub mod task;
pub mod urls;

pub use api::{ApiError, ApiResponse, ErrorCode};
pub use job::{JobIdentity, SubmitJobRequest};
pub use results::{HeartRequest, TaskResult};
pub use task::TaskStatus;
