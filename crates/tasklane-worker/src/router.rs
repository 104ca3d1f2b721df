use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tasklane_core::{Job, QueueName, QueueRegistry, QueueTask, TaskError};
use thiserror::Error;

use crate::pool::WorkerError;

/// Why a single job attempt failed
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Unknown task name `{task_name}` for queue {queue}")]
    UnknownTaskName { queue: QueueName, task_name: String },

    #[error("Invalid payload for task `{task_name}`: {source}")]
    InvalidPayload {
        task_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Unknown names and malformed payloads fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Handler(_) | JobError::Panicked(_))
    }
}

impl From<TaskError> for JobError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::UnknownTaskName { queue, task_name } => {
                JobError::UnknownTaskName { queue, task_name }
            }
            TaskError::InvalidPayload { task_name, source } => {
                JobError::InvalidPayload { task_name, source }
            }
            other => JobError::Handler(other.into()),
        }
    }
}

/// Handles every task kind of one queue
#[async_trait]
pub trait TaskHandler<T: QueueTask>: Send + Sync {
    async fn handle(&self, task: T) -> anyhow::Result<()>;
}

/// Dispatches jobs of one queue to their handler
#[async_trait]
pub trait Router: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn route(&self, job: &Job) -> Result<(), JobError>;
}

/// Decodes jobs into the queue's task enum and hands them to `H`
pub struct QueueRouter<T, H> {
    handler: Arc<H>,
    _task: PhantomData<fn() -> T>,
}

impl<T, H> QueueRouter<T, H>
where
    T: QueueTask,
    H: TaskHandler<T>,
{
    pub fn new(handler: Arc<H>) -> Self {
        QueueRouter {
            handler,
            _task: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> Router for QueueRouter<T, H>
where
    T: QueueTask,
    H: TaskHandler<T> + 'static,
{
    fn queue(&self) -> QueueName {
        T::QUEUE
    }

    async fn route(&self, job: &Job) -> Result<(), JobError> {
        if job.queue != T::QUEUE {
            return Err(JobError::UnknownTaskName {
                queue: T::QUEUE,
                task_name: job.task_name.clone(),
            });
        }

        let task = T::decode(&job.task_name, &job.payload)?;
        self.handler.handle(task).await.map_err(JobError::Handler)
    }
}

/// One router per queue
#[derive(Clone, Default)]
pub struct RouterTable {
    routers: HashMap<QueueName, Arc<dyn Router>>,
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a router, replacing any previous one for the same queue
    pub fn register(&mut self, router: Arc<dyn Router>) {
        self.routers.insert(router.queue(), router);
    }

    pub fn with(mut self, router: Arc<dyn Router>) -> Self {
        self.register(router);
        self
    }

    pub fn get(&self, queue: QueueName) -> Option<Arc<dyn Router>> {
        self.routers.get(&queue).cloned()
    }

    /// Every registered queue must have a router
    pub fn validate(&self, registry: &QueueRegistry) -> Result<(), WorkerError> {
        for queue in registry.names() {
            if !self.routers.contains_key(&queue) {
                return Err(WorkerError::MissingRouter(queue));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tasklane_core::{AiTask, EmailTask, NewsletterData, QueueSpec};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EmailTask>>,
    }

    #[async_trait]
    impl TaskHandler<EmailTask> for Recorder {
        async fn handle(&self, task: EmailTask) -> anyhow::Result<()> {
            self.seen.lock().push(task);
            Ok(())
        }
    }

    fn newsletter_job(task_name: &str) -> Job {
        Job::new(
            QueueName::Emails,
            task_name,
            br#"{"name":"Ana","email":"ana@x.com"}"#.to_vec(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_task_name() {
        let recorder = Arc::new(Recorder::default());
        let router: QueueRouter<EmailTask, _> = QueueRouter::new(recorder.clone());

        router.route(&newsletter_job("newsletter")).await.unwrap();

        assert_eq!(
            recorder.seen.lock().as_slice(),
            &[EmailTask::Newsletter(NewsletterData {
                name: "Ana".to_string(),
                email: "ana@x.com".to_string(),
            })]
        );
    }

    #[tokio::test]
    async fn test_unknown_task_name_invokes_nothing() {
        let recorder = Arc::new(Recorder::default());
        let router: QueueRouter<EmailTask, _> = QueueRouter::new(recorder.clone());

        let err = router.route(&newsletter_job("digest")).await.unwrap_err();

        assert!(matches!(err, JobError::UnknownTaskName { .. }));
        assert!(!err.is_retryable());
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_table_validation() {
        struct Noop;

        #[async_trait]
        impl TaskHandler<AiTask> for Noop {
            async fn handle(&self, _task: AiTask) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let table = RouterTable::new().with(Arc::new(QueueRouter::<AiTask, _>::new(Arc::new(Noop))));
        let ai_only = QueueRegistry::new([QueueSpec::new(QueueName::Ai)]).unwrap();

        assert!(table.validate(&ai_only).is_ok());
        assert!(matches!(
            table.validate(&QueueRegistry::all()),
            Err(WorkerError::MissingRouter(QueueName::Emails))
        ));
    }
}
