use crate::{QueueName, RetentionPolicy, RetryPolicy, TaskError, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job
pub type JobId = Uuid;

/// Job state in the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Job is waiting to be fetched by a worker
    Waiting,
    /// Job is currently being processed by a worker
    Active,
    /// Job completed successfully
    Completed,
    /// Job failed and will not be redelivered
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(TaskError::InvalidState {
                expected: "waiting|active|completed|failed".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

/// One unit of enqueued work, addressed by queue and task name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Queue the job was published to
    pub queue: QueueName,

    /// Task name selecting the handler inside the queue's router
    pub task_name: String,

    /// Task payload (JSON bytes, max 10MB)
    pub payload: Vec<u8>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Earliest time the job may be fetched
    pub available_at: DateTime<Utc>,

    /// Number of deliveries so far
    pub attempts: u32,

    /// Current state
    pub state: JobState,

    /// How long the job survives once terminal
    pub retention: RetentionPolicy,

    /// Redelivery rules on failure
    pub retry: RetryPolicy,

    /// Last error message, if any attempt failed
    pub error: Option<String>,

    /// Worker currently holding the job (if active)
    pub worker_id: Option<String>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job with default policies
    pub fn new(queue: QueueName, task_name: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        Job::builder(queue, task_name, payload).build()
    }

    /// Create a new job builder
    pub fn builder(queue: QueueName, task_name: impl Into<String>, payload: Vec<u8>) -> JobBuilder {
        JobBuilder::new(queue, task_name.into(), payload)
    }

    /// Check if the job may be fetched at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at <= now
    }

    /// Mark the job as fetched by a worker; counts one attempt
    pub fn activate(&mut self, worker_id: impl Into<String>) -> Result<()> {
        self.expect_state(JobState::Waiting)?;
        let now = Utc::now();
        self.state = JobState::Active;
        self.attempts += 1;
        self.worker_id = Some(worker_id.into());
        self.updated_at = now;
        Ok(())
    }

    /// Mark the job as completed successfully
    pub fn complete(&mut self) -> Result<()> {
        self.expect_state(JobState::Active)?;
        let now = Utc::now();
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.worker_id = None;
        Ok(())
    }

    /// Mark the job as failed for good
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.expect_state(JobState::Active)?;
        let now = Utc::now();
        self.state = JobState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(now);
        self.updated_at = now;
        self.worker_id = None;
        Ok(())
    }

    /// Put a failed attempt back in the queue after `delay`
    pub fn retry(&mut self, error: impl Into<String>, delay: std::time::Duration) -> Result<()> {
        self.expect_state(JobState::Active)?;
        let now = Utc::now();
        let available_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.state = JobState::Waiting;
        self.error = Some(error.into());
        self.available_at = available_at;
        self.updated_at = now;
        self.worker_id = None;
        Ok(())
    }

    /// Release an active job back to waiting without counting a failure
    pub fn release(&mut self) {
        self.state = JobState::Waiting;
        self.worker_id = None;
        self.updated_at = Utc::now();
    }

    /// Check if the retention window of a terminal job has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = match self.state {
            JobState::Completed => self.retention.complete_age(),
            JobState::Failed => self.retention.fail_age(),
            JobState::Waiting | JobState::Active => return false,
        };

        // An age or deadline out of chrono's range never expires.
        match (self.finished_at, age) {
            (Some(finished), Some(age)) => finished
                .checked_add_signed(age)
                .is_some_and(|deadline| deadline <= now),
            _ => false,
        }
    }

    fn expect_state(&self, expected: JobState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TaskError::InvalidState {
                expected: expected.as_str().to_string(),
                actual: self.state.as_str().to_string(),
            })
        }
    }
}

/// Builder for creating jobs with custom configuration
pub struct JobBuilder {
    queue: QueueName,
    task_name: String,
    payload: Vec<u8>,
    available_at: Option<DateTime<Utc>>,
    retention: RetentionPolicy,
    retry: RetryPolicy,
}

impl JobBuilder {
    pub fn new(queue: QueueName, task_name: String, payload: Vec<u8>) -> Self {
        JobBuilder {
            queue,
            task_name,
            payload,
            available_at: None,
            retention: RetentionPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn available_at(mut self, available_at: DateTime<Utc>) -> Self {
        self.available_at = Some(available_at);
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<Job> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TaskError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }

        let now = Utc::now();
        Ok(Job {
            id: Uuid::new_v4(),
            queue: self.queue,
            task_name: self.task_name,
            payload: self.payload,
            created_at: now,
            updated_at: now,
            available_at: self.available_at.unwrap_or(now),
            attempts: 0,
            state: JobState::Waiting,
            retention: self.retention,
            retry: self.retry,
            error: None,
            worker_id: None,
            finished_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_creation() {
        let job = Job::new(QueueName::Emails, "newsletter", b"{}".to_vec()).unwrap();

        assert_eq!(job.queue, QueueName::Emails);
        assert_eq!(job.task_name, "newsletter");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts, 0);
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = Job::new(QueueName::Ai, "place_embedding", vec![]).unwrap();

        assert!(job.complete().is_err());

        job.activate("worker-1").unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));

        job.complete().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.worker_id.is_none());

        assert!(matches!(job.fail("late"), Err(TaskError::InvalidState { .. })));
    }

    #[test]
    fn test_retry_delays_visibility() {
        let mut job = Job::new(QueueName::Ai, "place_embedding", vec![]).unwrap();
        job.activate("worker-1").unwrap();
        job.retry("boom", Duration::from_secs(60)).unwrap();

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(!job.is_ready(Utc::now()));
        assert!(job.is_ready(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_retention_expiry() {
        let mut job = Job::new(QueueName::Emails, "newsletter", vec![]).unwrap();
        job.activate("worker-1").unwrap();
        job.fail("boom").unwrap();

        let finished = job.finished_at.unwrap();
        assert!(!job.is_expired(finished + chrono::Duration::days(6)));
        assert!(job.is_expired(finished + chrono::Duration::days(7)));
    }

    #[test]
    fn test_huge_retention_does_not_expire_or_panic() {
        let mut job = Job::builder(QueueName::Emails, "newsletter", vec![])
            .retention(RetentionPolicy {
                remove_on_complete_secs: u64::MAX,
                remove_on_fail_secs: 9_000_000_000_000_000,
            })
            .build()
            .unwrap();
        job.activate("worker-1").unwrap();
        job.complete().unwrap();

        let finished = job.finished_at.unwrap();
        assert!(!job.is_expired(finished + chrono::Duration::days(365)));

        // Fits a TimeDelta but overflows the deadline.
        job.state = JobState::Failed;
        assert!(!job.is_expired(finished + chrono::Duration::days(365)));
    }

    #[test]
    fn test_huge_retry_delay_does_not_panic() {
        let mut job = Job::new(QueueName::Ai, "place_embedding", vec![]).unwrap();
        job.activate("worker-1").unwrap();
        job.retry("boom", Duration::from_secs(u64::MAX / 2)).unwrap();

        assert_eq!(job.state, JobState::Waiting);
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn test_payload_size_limit() {
        let result = Job::new(QueueName::Emails, "newsletter", vec![0u8; MAX_PAYLOAD_SIZE + 1]);

        match result {
            Err(TaskError::PayloadTooLarge { .. }) => {}
            _ => panic!("Expected PayloadTooLarge error"),
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("dead".parse::<JobState>().is_err());
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }
}
