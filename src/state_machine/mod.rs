pub mod job;
pub mod payload;
pub mod state;

pub use job::{ErrorDetails, FailureKind, Job, JobSummary, JobType, RetryConfig};
pub use payload::{
    Continuation, ExecutePayload, JobPayload, PassContext, PlanPayload, RenderPayload,
};
pub use state::{JobStatus, StateMachine, Transition};
