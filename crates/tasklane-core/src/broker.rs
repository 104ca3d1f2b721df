//! The broker seam shared by publishers and workers.

use crate::{Job, JobId, QueueName, TaskError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Broker rejected the request: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Durable job store with at-least-once delivery.
///
/// One handle is shared by the publisher and every consumer; implementations
/// serialize access internally.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open the connection. Calling it again on a connected broker is a no-op.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Store a waiting job
    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError>;

    /// Claim the next ready job of `queue`, if any
    async fn fetch(&self, queue: QueueName, worker_id: &str) -> Result<Option<Job>, BrokerError>;

    /// Report successful processing of an active job
    async fn complete(&self, job_id: JobId) -> Result<(), BrokerError>;

    /// Report a failed attempt; `retry_in` puts the job back in the queue after the delay
    async fn fail(
        &self,
        job_id: JobId,
        error: String,
        retry_in: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Look up a job that has not been purged yet
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Drop the connection. Closing a closed broker is a no-op.
    async fn close(&self) -> Result<(), BrokerError>;
}
