use crate::{Broker, BrokerError, Job, JobId, JobState, QueueName, TaskError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often a connected `MemoryBroker` purges expired jobs by default
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of jobs per state in one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    waiting: HashMap<QueueName, VecDeque<JobId>>,
    /// Present while connected; cancels the retention sweeper
    sweeper: Option<CancellationToken>,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.is_expired(now));
        before - self.jobs.len()
    }
}

/// In-process broker: per-queue FIFO of waiting jobs plus an index of every
/// job still inside its retention window.
///
/// Used directly with `memory://` URLs and as the store behind the broker
/// server. While connected it runs its own retention sweeper.
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    sweep_interval: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(State::default())),
            sweep_interval: sweep_interval.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL),
        }
    }

    /// Delete terminal jobs whose retention window has elapsed at `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.state.lock().purge_expired(now)
    }

    /// Put every job held by `worker_id` back at the head of its queue.
    ///
    /// Called when a worker disappears mid-job, which is what makes delivery
    /// at-least-once rather than at-most-once.
    pub fn release_worker(&self, worker_id: &str) -> usize {
        let mut state = self.state.lock();
        let State { jobs, waiting, .. } = &mut *state;
        let mut released = 0;

        for job in jobs.values_mut() {
            if job.state == JobState::Active && job.worker_id.as_deref() == Some(worker_id) {
                job.release();
                waiting.entry(job.queue).or_default().push_front(job.id);
                released += 1;
            }
        }

        released
    }

    /// Full per-state breakdown; walks every retained job of the queue
    pub fn counts(&self, queue: QueueName) -> QueueCounts {
        let state = self.state.lock();
        let mut counts = QueueCounts::default();

        for job in state.jobs.values().filter(|job| job.queue == queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }

        counts
    }

    /// Waiting jobs of `queue`, delayed retries included
    pub fn waiting_len(&self, queue: QueueName) -> usize {
        self.state
            .lock()
            .waiting
            .get(&queue)
            .map_or(0, VecDeque::len)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().sweeper.is_some()
    }

    fn spawn_sweeper(&self, shutdown: CancellationToken) {
        let state = Arc::clone(&self.state);
        let every = self.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = state.lock().purge_expired(Utc::now());
                        if purged > 0 {
                            info!(purged, "Purged expired jobs");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        break;
                    }
                }
            }
        });
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut state = self.state.lock();
        if state.sweeper.is_none() {
            return Err(BrokerError::NotConnected);
        }
        f(&mut state)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.sweeper.is_none() {
            let shutdown = CancellationToken::new();
            self.spawn_sweeper(shutdown.clone());
            state.sweeper = Some(shutdown);
            debug!(every = ?self.sweep_interval, "Retention sweeper started");
        }
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        self.with_state(|state| {
            let job_id = job.id;
            if state.jobs.contains_key(&job_id) {
                return Err(BrokerError::Rejected(format!("Job {} already exists", job_id)));
            }

            if job.state == JobState::Waiting {
                state.waiting.entry(job.queue).or_default().push_back(job_id);
            }
            debug!(queue = %job.queue, job_id = %job_id, task = %job.task_name, "Job enqueued");
            state.jobs.insert(job_id, job);
            Ok(job_id)
        })
    }

    async fn fetch(&self, queue: QueueName, worker_id: &str) -> Result<Option<Job>, BrokerError> {
        self.with_state(|state| {
            let now = Utc::now();
            let State { jobs, waiting, .. } = state;

            let Some(ids) = waiting.get_mut(&queue) else {
                return Ok(None);
            };

            // Drop ids of jobs that were purged or already moved on.
            ids.retain(|id| jobs.get(id).is_some_and(|job| job.state == JobState::Waiting));

            let Some(position) = ids
                .iter()
                .position(|id| jobs.get(id).is_some_and(|job| job.is_ready(now)))
            else {
                return Ok(None);
            };

            let Some(job_id) = ids.remove(position) else {
                return Ok(None);
            };
            let job = jobs.get_mut(&job_id).ok_or(TaskError::JobNotFound(job_id))?;
            job.activate(worker_id)?;
            Ok(Some(job.clone()))
        })
    }

    async fn complete(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.with_state(|state| {
            let job = state.jobs.get_mut(&job_id).ok_or(TaskError::JobNotFound(job_id))?;
            job.complete()?;
            Ok(())
        })
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: String,
        retry_in: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.with_state(|state| {
            let job = state.jobs.get_mut(&job_id).ok_or(TaskError::JobNotFound(job_id))?;

            match retry_in {
                Some(delay) => {
                    job.retry(error, delay)?;
                    let queue = job.queue;
                    state.waiting.entry(queue).or_default().push_back(job_id);
                }
                None => job.fail(error)?,
            }
            Ok(())
        })
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        self.with_state(|state| Ok(state.jobs.get(&job_id).cloned()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Some(sweeper) = self.state.lock().sweeper.take() {
            sweeper.cancel();
        }
        Ok(())
    }
}
