mod error;
mod job;
mod memory;
mod policy;
mod queue;

pub mod broker;
pub mod task;

pub use broker::{Broker, BrokerError};
pub use error::{Result, TaskError};
pub use job::{Job, JobBuilder, JobId, JobState};
pub use memory::{MemoryBroker, QueueCounts, DEFAULT_SWEEP_INTERVAL};
pub use policy::{RetentionPolicy, RetryPolicy, DEFAULT_RETENTION_SECS, MAX_RETENTION_SECS};
pub use queue::{QueueName, QueueRegistry, QueueSpec};
pub use task::{AiTask, EmailTask, NewsletterData, PlaceEmbeddingData, QueueTask, Task};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
