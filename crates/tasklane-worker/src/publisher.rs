use std::sync::Arc;
use tasklane_core::{
    Broker, BrokerError, Job, JobId, QueueName, QueueRegistry, RetentionPolicy, RetryPolicy, Task,
    TaskError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("Publisher is closed")]
    Closed,
}

/// Defaults stamped on every published job
#[derive(Debug, Clone, Copy, Default)]
pub struct PublisherConfig {
    pub retention: RetentionPolicy,
    pub retry: RetryPolicy,
    /// Skip the broker entirely; `enqueue` returns `Ok(None)`
    pub test_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherState {
    Idle,
    Connected,
    Closed,
}

/// Publishes tasks to their queue
pub struct TaskPublisher {
    broker: Arc<dyn Broker>,
    registry: Arc<QueueRegistry>,
    config: PublisherConfig,
    state: Mutex<PublisherState>,
}

impl TaskPublisher {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<QueueRegistry>, config: PublisherConfig) -> Self {
        TaskPublisher {
            broker,
            registry,
            config,
            state: Mutex::new(PublisherState::Idle),
        }
    }

    /// Connect eagerly. Also reopens a closed publisher.
    pub async fn start(&self) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        if *state == PublisherState::Connected {
            return Ok(());
        }
        if !self.config.test_mode {
            self.broker.connect().await?;
        }
        *state = PublisherState::Connected;
        info!("Publisher started");
        Ok(())
    }

    /// Stop accepting new jobs. The broker connection itself is shared and left open.
    pub async fn close(&self) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        if *state != PublisherState::Closed {
            *state = PublisherState::Closed;
            info!("Publisher closed");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.lock().await == PublisherState::Connected
    }

    /// Publish a typed task and return the id of the stored job
    pub async fn enqueue(&self, task: impl Into<Task>) -> Result<Option<JobId>, PublishError> {
        let task = task.into();
        self.registry.ensure(task.queue())?;
        let payload = task.to_payload()?;
        self.publish(task.queue(), task.name(), payload).await
    }

    /// Publish by wire-level queue and task names.
    ///
    /// The queue must be registered; the task name is only checked by the
    /// consuming router, so an unknown name produces a failed job.
    pub async fn enqueue_raw(
        &self,
        queue: &str,
        task_name: &str,
        payload: Vec<u8>,
    ) -> Result<Option<JobId>, PublishError> {
        let queue = self.registry.resolve(queue)?;
        self.publish(queue, task_name, payload).await
    }

    async fn publish(
        &self,
        queue: QueueName,
        task_name: &str,
        payload: Vec<u8>,
    ) -> Result<Option<JobId>, PublishError> {
        self.registry.ensure(queue)?;

        if self.config.test_mode {
            debug!(queue = %queue, task = task_name, "Test mode, job not published");
            return Ok(None);
        }

        self.ensure_connected().await?;

        let job = Job::builder(queue, task_name, payload)
            .retention(self.config.retention)
            .retry(self.config.retry)
            .build()?;
        let job_id = self.broker.enqueue(job).await?;

        debug!(queue = %queue, job_id = %job_id, task = task_name, "Job published");
        Ok(Some(job_id))
    }

    async fn ensure_connected(&self) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        match *state {
            PublisherState::Connected => Ok(()),
            PublisherState::Closed => Err(PublishError::Closed),
            PublisherState::Idle => {
                self.broker.connect().await?;
                *state = PublisherState::Connected;
                Ok(())
            }
        }
    }
}
