pub mod app;
pub mod collaborators;
pub mod config;
pub mod executor;
pub mod handlers;
pub mod lifecycle;
pub mod pool;
pub mod publisher;
pub mod router;
pub mod scheduler;

pub use app::{build, Collaborators};
pub use config::{ConfigError, Settings};
pub use lifecycle::{CloseErrors, Lifecycle, LifecycleError, LifecycleState};
pub use pool::{WorkerError, WorkerPool, WorkerState};
pub use publisher::{PublishError, PublisherConfig, TaskPublisher};
pub use router::{JobError, QueueRouter, Router, RouterTable, TaskHandler};
pub use scheduler::{CronConfig, CronScheduler, SchedulerError};
