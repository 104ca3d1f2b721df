use crate::{Result, TaskError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of queues known to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Emails,
    Ai,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Emails, QueueName::Ai];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Emails => "emails",
            QueueName::Ai => "ai",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "emails" => Ok(QueueName::Emails),
            "ai" => Ok(QueueName::Ai),
            other => Err(TaskError::UnknownQueue(other.to_string())),
        }
    }
}

/// A queue enabled for this process, with its consumer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: QueueName,
    pub concurrency: usize,
}

impl QueueSpec {
    pub fn new(name: QueueName) -> Self {
        QueueSpec {
            name,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Immutable set of queues a process publishes to and consumes from.
///
/// Built once at startup and shared by reference, so tests and production can
/// run independent registries side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRegistry {
    queues: Vec<QueueSpec>,
}

impl QueueRegistry {
    /// Build a registry, rejecting duplicates and zero concurrency.
    pub fn new(specs: impl IntoIterator<Item = QueueSpec>) -> Result<Self> {
        let mut queues: Vec<QueueSpec> = Vec::new();

        for spec in specs {
            if spec.concurrency == 0 {
                return Err(TaskError::InvalidConcurrency(spec.name));
            }
            if queues.iter().any(|q| q.name == spec.name) {
                return Err(TaskError::DuplicateQueue(spec.name));
            }
            queues.push(spec);
        }

        Ok(QueueRegistry { queues })
    }

    /// Every known queue with a single consumer each.
    pub fn all() -> Self {
        QueueRegistry {
            queues: QueueName::ALL.iter().copied().map(QueueSpec::new).collect(),
        }
    }

    /// Resolve a wire-level queue name against this registry.
    pub fn resolve(&self, name: &str) -> Result<QueueName> {
        let queue = QueueName::from_str(name)?;
        self.ensure(queue)?;
        Ok(queue)
    }

    pub fn ensure(&self, queue: QueueName) -> Result<()> {
        if self.contains(queue) {
            Ok(())
        } else {
            Err(TaskError::QueueNotRegistered(queue))
        }
    }

    pub fn contains(&self, queue: QueueName) -> bool {
        self.queues.iter().any(|q| q.name == queue)
    }

    pub fn concurrency(&self, queue: QueueName) -> Option<usize> {
        self.queues
            .iter()
            .find(|q| q.name == queue)
            .map(|q| q.concurrency)
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn names(&self) -> impl Iterator<Item = QueueName> + '_ {
        self.queues.iter().map(|q| q.name)
    }
}
