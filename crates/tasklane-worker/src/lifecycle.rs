//! Startup and shutdown of every background component as one unit.

use crate::collaborators::Connection;
use crate::pool::{WorkerError, WorkerPool};
use crate::publisher::{PublishError, TaskPublisher};
use crate::scheduler::{CronScheduler, SchedulerError};

use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tasklane_core::{Broker, BrokerError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Failed to connect {name}: {message}")]
    Connection { name: String, message: String },

    #[error("Failed to start publisher: {0}")]
    Publisher(#[from] PublishError),

    #[error("Failed to start workers: {0}")]
    Workers(#[from] WorkerError),

    #[error("Failed to start scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Every failure collected while closing
#[derive(Debug)]
pub struct CloseErrors(pub Vec<anyhow::Error>);

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} component(s) failed to close", self.0.len())?;
        for err in &self.0 {
            write!(f, "; {:#}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleState {
    pub publisher_connected: bool,
    pub workers_running: bool,
    pub crons_running: bool,
}

impl LifecycleState {
    fn is_started(&self) -> bool {
        self.publisher_connected || self.workers_running || self.crons_running
    }
}

/// Owns the broker handle, external connections and the three components
pub struct Lifecycle {
    broker: Arc<dyn Broker>,
    connections: Vec<Arc<dyn Connection>>,
    publisher: Arc<TaskPublisher>,
    workers: Arc<WorkerPool>,
    scheduler: Arc<CronScheduler>,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(
        broker: Arc<dyn Broker>,
        connections: Vec<Arc<dyn Connection>>,
        publisher: Arc<TaskPublisher>,
        workers: Arc<WorkerPool>,
        scheduler: Arc<CronScheduler>,
    ) -> Self {
        Lifecycle {
            broker,
            connections,
            publisher,
            workers,
            scheduler,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn publisher(&self) -> &Arc<TaskPublisher> {
        &self.publisher
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    /// Connect dependencies, then start publisher, workers and scheduler.
    ///
    /// On failure everything already started is torn down again.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        if state.is_started() {
            return Ok(());
        }

        self.connect_all().await?;

        if let Err(e) = self.start_components(&mut state).await {
            error!("Startup failed, tearing down: {}", e);
            if let Err(close) = self.close_components(&mut state).await {
                error!("Teardown after failed startup incomplete: {}", close);
            }
            return Err(e);
        }

        info!("All background components started");
        Ok(())
    }

    /// Stop scheduler, workers and publisher, then disconnect dependencies.
    ///
    /// Every step runs even if an earlier one failed.
    pub async fn close_all(&self) -> Result<(), CloseErrors> {
        let mut state = self.state.lock().await;
        if !state.is_started() {
            return Ok(());
        }

        let result = self.close_components(&mut state).await;
        info!("All background components stopped");
        result
    }

    async fn connect_all(&self) -> Result<(), LifecycleError> {
        let broker = async {
            self.broker.connect().await.map_err(|e| LifecycleError::Connection {
                name: "broker".to_string(),
                message: e.to_string(),
            })
        };
        let others = join_all(self.connections.iter().map(|conn| async move {
            conn.connect().await.map_err(|e| LifecycleError::Connection {
                name: conn.name().to_string(),
                message: format!("{:#}", e),
            })
        }));

        let (broker, others) = futures::join!(broker, others);

        let failure = std::iter::once(broker).chain(others).find_map(Result::err);
        if let Some(err) = failure {
            // Release whatever did connect.
            if let Err(close) = self.disconnect_all().await {
                error!("Disconnect after failed startup incomplete: {}", close);
            }
            return Err(err);
        }

        Ok(())
    }

    /// Start all three concurrently. Workers and scheduler only spawn tasks and never block.
    async fn start_components(&self, state: &mut LifecycleState) -> Result<(), LifecycleError> {
        let (publisher, workers, scheduler) = futures::join!(
            self.publisher.start(),
            async { self.workers.start() },
            async { self.scheduler.start() },
        );

        state.publisher_connected = publisher.is_ok();
        state.workers_running = workers.is_ok();
        state.crons_running = scheduler.is_ok();

        publisher?;
        workers?;
        scheduler?;
        Ok(())
    }

    async fn close_components(&self, state: &mut LifecycleState) -> Result<(), CloseErrors> {
        let mut errors: Vec<anyhow::Error> = Vec::new();

        if let Err(e) = self.scheduler.close().await {
            error!("Failed to close scheduler: {}", e);
            errors.push(e.into());
        }
        state.crons_running = false;

        if let Err(e) = self.workers.close().await {
            error!("Failed to close workers: {}", e);
            errors.push(e.into());
        }
        state.workers_running = false;

        if let Err(e) = self.publisher.close().await {
            error!("Failed to close publisher: {}", e);
            errors.push(e.into());
        }
        state.publisher_connected = false;

        if let Err(CloseErrors(disconnect)) = self.disconnect_all().await {
            errors.extend(disconnect);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseErrors(errors))
        }
    }

    async fn disconnect_all(&self) -> Result<(), CloseErrors> {
        let broker = async {
            self.broker
                .close()
                .await
                .map_err(|e: BrokerError| anyhow::Error::new(e).context("Failed to close broker"))
        };
        let others = join_all(self.connections.iter().map(|conn| async move {
            conn.close()
                .await
                .map_err(|e| e.context(format!("Failed to close {}", conn.name())))
        }));

        let (broker, others) = futures::join!(broker, others);

        let errors: Vec<anyhow::Error> = std::iter::once(broker)
            .chain(others)
            .filter_map(Result::err)
            .inspect(|e| error!("{:#}", e))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseErrors(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublisherConfig;
    use crate::router::{QueueRouter, RouterTable, TaskHandler};
    use crate::scheduler::CronConfig;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tasklane_core::{AiTask, EmailTask, Job, JobId, MemoryBroker, NewsletterData, QueueName, QueueRegistry};

    struct FakeDb {
        fail_connect: bool,
        fail_close: bool,
        connected: AtomicBool,
        closes: AtomicUsize,
    }

    impl FakeDb {
        fn new(fail_connect: bool) -> Arc<Self> {
            Arc::new(FakeDb {
                fail_connect,
                fail_close: false,
                connected: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            })
        }

        fn failing_close() -> Arc<Self> {
            Arc::new(FakeDb {
                fail_connect: false,
                fail_close: true,
                connected: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connection for FakeDb {
        fn name(&self) -> &str {
            "db"
        }

        async fn connect(&self) -> anyhow::Result<()> {
            if self.fail_connect {
                anyhow::bail!("db unreachable");
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("disk full");
            }
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Memory broker whose close always reports an error
    struct UncloseableBroker {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl Broker for UncloseableBroker {
        async fn connect(&self) -> Result<(), BrokerError> {
            self.inner.connect().await
        }

        async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
            self.inner.enqueue(job).await
        }

        async fn fetch(&self, queue: QueueName, worker_id: &str) -> Result<Option<Job>, BrokerError> {
            self.inner.fetch(queue, worker_id).await
        }

        async fn complete(&self, job_id: JobId) -> Result<(), BrokerError> {
            self.inner.complete(job_id).await
        }

        async fn fail(&self, job_id: JobId, error: String, retry_in: Option<Duration>) -> Result<(), BrokerError> {
            self.inner.fail(job_id, error, retry_in).await
        }

        async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
            self.inner.job(job_id).await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.inner.close().await?;
            Err(BrokerError::Connection("socket already gone".to_string()))
        }
    }

    struct Slow {
        done: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler<EmailTask> for Slow {
        async fn handle(&self, _task: EmailTask) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TaskHandler<AiTask> for Slow {
        async fn handle(&self, _task: AiTask) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn lifecycle(db: Arc<FakeDb>, handler: Arc<Slow>, scheduler: CronScheduler) -> (Lifecycle, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = lifecycle_with(broker.clone(), vec![db as Arc<dyn Connection>], handler, scheduler);
        (lifecycle, broker)
    }

    fn lifecycle_with(
        broker: Arc<dyn Broker>,
        connections: Vec<Arc<dyn Connection>>,
        handler: Arc<Slow>,
        scheduler: CronScheduler,
    ) -> Lifecycle {
        let registry = Arc::new(QueueRegistry::all());
        let routers = RouterTable::new()
            .with(Arc::new(QueueRouter::<EmailTask, _>::new(handler.clone())))
            .with(Arc::new(QueueRouter::<AiTask, _>::new(handler)));

        let publisher = Arc::new(TaskPublisher::new(
            broker.clone(),
            registry.clone(),
            PublisherConfig::default(),
        ));
        let workers = Arc::new(
            WorkerPool::new(broker.clone(), registry, routers, "lifecycle-test")
                .with_poll_interval(Duration::from_millis(10)),
        );

        Lifecycle::new(broker, connections, publisher, workers, Arc::new(scheduler))
    }

    fn slow() -> Arc<Slow> {
        Arc::new(Slow {
            done: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_close_without_start_is_noop() {
        let db = FakeDb::new(false);
        let (lifecycle, _) = lifecycle(db.clone(), slow(), CronScheduler::new());

        lifecycle.close_all().await.unwrap();
        assert_eq!(db.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let db = FakeDb::new(false);
        let (lifecycle, _) = lifecycle(db.clone(), slow(), CronScheduler::new());

        lifecycle.start_all().await.unwrap();
        lifecycle.start_all().await.unwrap();
        assert_eq!(
            lifecycle.state().await,
            LifecycleState {
                publisher_connected: true,
                workers_running: true,
                crons_running: true,
            }
        );
        assert!(db.connected.load(Ordering::SeqCst));

        lifecycle.close_all().await.unwrap();
        lifecycle.close_all().await.unwrap();
        assert_eq!(lifecycle.state().await, LifecycleState::default());
        assert!(!db.connected.load(Ordering::SeqCst));
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_close_does_not_skip_others() {
        let broken = FakeDb::failing_close();
        let healthy = FakeDb::new(false);
        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = lifecycle_with(
            broker.clone(),
            vec![broken.clone() as Arc<dyn Connection>, healthy.clone() as Arc<dyn Connection>],
            slow(),
            CronScheduler::new(),
        );
        lifecycle.start_all().await.unwrap();

        let CloseErrors(errors) = lifecycle.close_all().await.unwrap_err();

        assert_eq!(errors.len(), 1);
        let message = format!("{:#}", errors[0]);
        assert!(message.contains("Failed to close db"), "{}", message);
        assert!(message.contains("disk full"), "{}", message);

        assert_eq!(broken.closes.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.closes.load(Ordering::SeqCst), 1);
        assert!(!healthy.connected.load(Ordering::SeqCst));
        assert!(!lifecycle.workers().is_running());
        assert!(!lifecycle.scheduler().is_running());
        assert!(!broker.is_connected());
        assert_eq!(lifecycle.state().await, LifecycleState::default());
    }

    #[tokio::test]
    async fn test_failed_broker_close_still_closes_connections() {
        let db = FakeDb::new(false);
        let broker = Arc::new(UncloseableBroker {
            inner: MemoryBroker::new(),
        });
        let lifecycle = lifecycle_with(
            broker.clone(),
            vec![db.clone() as Arc<dyn Connection>],
            slow(),
            CronScheduler::new(),
        );
        lifecycle.start_all().await.unwrap();

        let CloseErrors(errors) = lifecycle.close_all().await.unwrap_err();

        assert_eq!(errors.len(), 1);
        let message = format!("{:#}", errors[0]);
        assert!(message.contains("Failed to close broker"), "{}", message);
        assert!(message.contains("socket already gone"), "{}", message);

        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert!(!db.connected.load(Ordering::SeqCst));
        assert!(!lifecycle.workers().is_running());
        assert!(!broker.inner.is_connected());
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let db = FakeDb::new(true);
        let (lifecycle, _) = lifecycle(db, slow(), CronScheduler::new());

        match lifecycle.start_all().await {
            Err(LifecycleError::Connection { name, .. }) => assert_eq!(name, "db"),
            other => panic!("Expected a connection error, got {:?}", other),
        }
        assert!(!lifecycle.workers().is_running());
    }

    #[tokio::test]
    async fn test_scheduler_failure_tears_down_workers() {
        let db = FakeDb::new(false);
        let scheduler = CronScheduler::new();
        scheduler.register(CronConfig::new("broken", "not a cron", chrono_tz::UTC, || {
            async {}.boxed()
        }));
        let (lifecycle, _) = lifecycle(db.clone(), slow(), scheduler);

        assert!(matches!(
            lifecycle.start_all().await,
            Err(LifecycleError::Scheduler(_))
        ));
        assert!(!lifecycle.workers().is_running());
        assert!(!lifecycle.publisher().is_connected().await);
        assert!(!db.connected.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state().await, LifecycleState::default());
    }

    #[tokio::test]
    async fn test_close_lets_active_job_finish() {
        let db = FakeDb::new(false);
        let handler = slow();
        let (lifecycle, broker) = lifecycle(db, handler.clone(), CronScheduler::new());
        lifecycle.start_all().await.unwrap();

        let job_id = lifecycle
            .publisher()
            .enqueue(NewsletterData {
                name: "Ana".to_string(),
                email: "ana@x.com".to_string(),
            })
            .await
            .unwrap()
            .unwrap();

        // Wait until a consumer holds the job.
        for _ in 0..100 {
            if broker.get(&job_id).and_then(|job| job.worker_id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        lifecycle.close_all().await.unwrap();

        assert_eq!(handler.done.load(Ordering::SeqCst), 1);
        assert_eq!(
            broker.get(&job_id).map(|job| job.state),
            Some(tasklane_core::JobState::Completed)
        );
    }
}
