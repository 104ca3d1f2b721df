//! The closed set of task kinds, grouped by the queue that runs them.
//!
//! Each queue has its own enum so routers match exhaustively; the wire form of
//! a task is its name plus a JSON payload.

use crate::{QueueName, Result, TaskError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const TASK_NEWSLETTER: &str = "newsletter";
pub const TASK_PLACE_EMBEDDING: &str = "place_embedding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsletterData {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceEmbeddingData {
    pub place_id: u64,
}

/// A task kind bound to exactly one queue.
pub trait QueueTask: Sized + Send + 'static {
    const QUEUE: QueueName;

    /// Wire name selecting the handler
    fn name(&self) -> &'static str;

    /// Serialize the payload carried by this task
    fn to_payload(&self) -> Result<Vec<u8>>;

    /// Rebuild a task from its wire name and payload
    fn decode(task_name: &str, payload: &[u8]) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTask {
    Newsletter(NewsletterData),
}

impl QueueTask for EmailTask {
    const QUEUE: QueueName = QueueName::Emails;

    fn name(&self) -> &'static str {
        match self {
            EmailTask::Newsletter(_) => TASK_NEWSLETTER,
        }
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        match self {
            EmailTask::Newsletter(data) => encode(self.name(), data),
        }
    }

    fn decode(task_name: &str, payload: &[u8]) -> Result<Self> {
        match task_name {
            TASK_NEWSLETTER => Ok(EmailTask::Newsletter(decode(task_name, payload)?)),
            other => Err(unknown(Self::QUEUE, other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiTask {
    PlaceEmbedding(PlaceEmbeddingData),
}

impl QueueTask for AiTask {
    const QUEUE: QueueName = QueueName::Ai;

    fn name(&self) -> &'static str {
        match self {
            AiTask::PlaceEmbedding(_) => TASK_PLACE_EMBEDDING,
        }
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        match self {
            AiTask::PlaceEmbedding(data) => encode(self.name(), data),
        }
    }

    fn decode(task_name: &str, payload: &[u8]) -> Result<Self> {
        match task_name {
            TASK_PLACE_EMBEDDING => Ok(AiTask::PlaceEmbedding(decode(task_name, payload)?)),
            other => Err(unknown(Self::QUEUE, other)),
        }
    }
}

/// Any task the system can publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Emails(EmailTask),
    Ai(AiTask),
}

impl Task {
    pub fn queue(&self) -> QueueName {
        match self {
            Task::Emails(_) => EmailTask::QUEUE,
            Task::Ai(_) => AiTask::QUEUE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::Emails(task) => task.name(),
            Task::Ai(task) => task.name(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        match self {
            Task::Emails(task) => task.to_payload(),
            Task::Ai(task) => task.to_payload(),
        }
    }
}

impl From<EmailTask> for Task {
    fn from(task: EmailTask) -> Self {
        Task::Emails(task)
    }
}

impl From<AiTask> for Task {
    fn from(task: AiTask) -> Self {
        Task::Ai(task)
    }
}

impl From<NewsletterData> for Task {
    fn from(data: NewsletterData) -> Self {
        Task::Emails(EmailTask::Newsletter(data))
    }
}

impl From<PlaceEmbeddingData> for Task {
    fn from(data: PlaceEmbeddingData) -> Self {
        Task::Ai(AiTask::PlaceEmbedding(data))
    }
}

fn encode<T: Serialize>(task_name: &str, data: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(data).map_err(|source| TaskError::InvalidPayload {
        task_name: task_name.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(task_name: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|source| TaskError::InvalidPayload {
        task_name: task_name.to_string(),
        source,
    })
}

fn unknown(queue: QueueName, task_name: &str) -> TaskError {
    TaskError::UnknownTaskName {
        queue,
        task_name: task_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_addresses() {
        let task = Task::from(NewsletterData {
            name: "Ana".to_string(),
            email: "ana@x.com".to_string(),
        });
        assert_eq!(task.queue(), QueueName::Emails);
        assert_eq!(task.name(), TASK_NEWSLETTER);

        let task = Task::from(PlaceEmbeddingData { place_id: 42 });
        assert_eq!(task.queue(), QueueName::Ai);
        assert_eq!(task.name(), TASK_PLACE_EMBEDDING);
    }

    #[test]
    fn test_payload_uses_camel_case_wire_form() {
        let task = Task::from(PlaceEmbeddingData { place_id: 42 });
        let payload = task.to_payload().unwrap();
        assert_eq!(payload, br#"{"placeId":42}"#);

        let decoded = AiTask::decode(TASK_PLACE_EMBEDDING, &payload).unwrap();
        assert_eq!(decoded, AiTask::PlaceEmbedding(PlaceEmbeddingData { place_id: 42 }));
    }

    #[test]
    fn test_unknown_task_name_is_scoped_to_queue() {
        let payload = br#"{"placeId":42}"#;

        match EmailTask::decode(TASK_PLACE_EMBEDDING, payload) {
            Err(TaskError::UnknownTaskName { queue, task_name }) => {
                assert_eq!(queue, QueueName::Emails);
                assert_eq!(task_name, TASK_PLACE_EMBEDDING);
            }
            other => panic!("Expected UnknownTaskName, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload() {
        let result = EmailTask::decode(TASK_NEWSLETTER, br#"{"name":"Ana"}"#);
        assert!(matches!(result, Err(TaskError::InvalidPayload { .. })));
    }

    #[test]
    fn test_task_from_yaml_like_config() {
        let task: Task = serde_json::from_str(
            r#"{"emails":{"newsletter":{"name":"Ana","email":"ana@x.com"}}}"#,
        )
        .unwrap();
        assert_eq!(task.name(), TASK_NEWSLETTER);
    }
}
