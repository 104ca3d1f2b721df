use crate::executor::JobExecutor;
use crate::router::RouterTable;
use tasklane_core::{Broker, Job, QueueName, QueueRegistry};

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No router registered for queue {0}")]
    MissingRouter(QueueName),

    #[error("{} consumer(s) did not stop cleanly: {}", .0.len(), .0.join("; "))]
    Consumers(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

struct Running {
    shutdown: CancellationToken,
    consumers: Vec<(QueueName, JoinHandle<()>)>,
}

/// Consumers for every registered queue, sharing one broker handle
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<QueueRegistry>,
    routers: RouterTable,
    worker_id: String,
    poll_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<QueueRegistry>,
        routers: RouterTable,
        worker_id: impl Into<String>,
    ) -> Self {
        WorkerPool {
            broker,
            registry,
            routers,
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(500),
            running: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn `concurrency` consumers per registered queue. Starting twice is a no-op.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        self.routers.validate(&self.registry)?;

        let shutdown = CancellationToken::new();
        let mut consumers = Vec::new();

        for spec in self.registry.queues() {
            let router = self
                .routers
                .get(spec.name)
                .ok_or(WorkerError::MissingRouter(spec.name))?;

            for slot in 0..spec.concurrency {
                let consumer = Consumer {
                    queue: spec.name,
                    slot,
                    broker: self.broker.clone(),
                    executor: JobExecutor::new(router.clone()),
                    worker_id: self.worker_id.clone(),
                    poll_interval: self.poll_interval,
                    shutdown: shutdown.clone(),
                };
                consumers.push((spec.name, tokio::spawn(consumer.run())));
            }

            info!(queue = %spec.name, concurrency = spec.concurrency, "Worker started");
        }

        *running = Some(Running {
            shutdown,
            consumers,
        });
        Ok(())
    }

    /// Stop fetching, let in-flight jobs finish and join every consumer
    pub async fn close(&self) -> Result<(), WorkerError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.shutdown.cancel();

        let (queues, handles): (Vec<_>, Vec<_>) = running.consumers.into_iter().unzip();
        let results = join_all(handles).await;

        let failures: Vec<String> = queues
            .into_iter()
            .zip(results)
            .filter_map(|(queue, result)| {
                result
                    .err()
                    .map(|e| format!("consumer for queue {} failed: {}", queue, e))
            })
            .collect();

        info!(worker_id = %self.worker_id, "Workers stopped");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::Consumers(failures))
        }
    }

    pub fn state(&self, queue: QueueName) -> WorkerState {
        if self.running.lock().is_some() && self.registry.contains(queue) {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

struct Consumer {
    queue: QueueName,
    slot: usize,
    broker: Arc<dyn Broker>,
    executor: JobExecutor,
    worker_id: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Consumer {
    async fn run(self) {
        debug!(queue = %self.queue, slot = self.slot, "Consumer started");

        // Fetch is never raced against shutdown so a claimed job is always processed.
        while !self.shutdown.is_cancelled() {
            match self.broker.fetch(self.queue, &self.worker_id).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to fetch job");
                    self.idle().await;
                }
            }
        }

        debug!(queue = %self.queue, slot = self.slot, "Consumer stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        let attempts = job.attempts;
        let retry = job.retry;
        let task_name = job.task_name.clone();

        debug!(queue = %self.queue, job_id = %job_id, task = %task_name, attempts, "Processing job");

        match self.executor.execute(job).await {
            Ok(()) => {
                if let Err(e) = self.broker.complete(job_id).await {
                    error!(queue = %self.queue, job_id = %job_id, error = %e, "Failed to report job completion");
                } else {
                    info!(queue = %self.queue, job_id = %job_id, task = %task_name, "Job completed");
                }
            }
            Err(err) => {
                error!(queue = %self.queue, job_id = %job_id, task = %task_name, error = %err, "Job failed");

                let retry_in = (err.is_retryable() && retry.should_retry(attempts))
                    .then(|| retry.delay(attempts));
                if let Some(delay) = retry_in {
                    info!(queue = %self.queue, job_id = %job_id, attempts, "Retrying job in {:?}", delay);
                }

                if let Err(e) = self.broker.fail(job_id, err.to_string(), retry_in).await {
                    error!(queue = %self.queue, job_id = %job_id, error = %e, "Failed to report job failure");
                }
            }
        }
    }
}
