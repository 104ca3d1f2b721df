use crate::router::{JobError, Router};
use std::any::Any;
use std::sync::Arc;
use tasklane_core::Job;
use tracing::error;

/// Runs a job through its router with panic recovery
pub struct JobExecutor {
    router: Arc<dyn Router>,
}

impl JobExecutor {
    pub fn new(router: Arc<dyn Router>) -> Self {
        JobExecutor { router }
    }

    /// Execute the job; a panicking handler becomes `JobError::Panicked`
    pub async fn execute(&self, job: Job) -> Result<(), JobError> {
        let job_id = job.id;
        let router = self.router.clone();

        match tokio::spawn(async move { router.route(&job).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(job_id = %job_id, "Job panicked: {}", message);
                Err(JobError::Panicked(message))
            }
            Err(_) => {
                error!(job_id = %job_id, "Job was cancelled");
                Err(JobError::Panicked("Job was cancelled".to_string()))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
