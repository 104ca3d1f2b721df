use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasklane_core::{Job, JobId, QueueName};

/// Message types for the TCP protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Enqueue = 1,
    Fetch = 2,
    Complete = 3,
    Fail = 4,
    QueryJob = 5,
    Ack = 6,
    Nack = 7,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Enqueue),
            2 => Some(MessageType::Fetch),
            3 => Some(MessageType::Complete),
            4 => Some(MessageType::Fail),
            5 => Some(MessageType::QueryJob),
            6 => Some(MessageType::Ack),
            7 => Some(MessageType::Nack),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Publish a new job
    Enqueue(EnqueueRequest),

    /// Worker claims the next job of a queue
    Fetch(FetchRequest),

    /// Worker reports success
    Complete(CompleteRequest),

    /// Worker reports failure, optionally asking for redelivery
    Fail(FailRequest),

    /// Look up a job
    QueryJob(QueryJobRequest),

    /// Positive acknowledgment
    Ack(AckResponse),

    /// Negative acknowledgment
    Nack(NackResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Enqueue(_) => MessageType::Enqueue,
            Message::Fetch(_) => MessageType::Fetch,
            Message::Complete(_) => MessageType::Complete,
            Message::Fail(_) => MessageType::Fail,
            Message::QueryJob(_) => MessageType::QueryJob,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
        }
    }

    pub fn ack() -> Self {
        Message::Ack(AckResponse::default())
    }

    pub fn nack(error: impl Into<String>) -> Self {
        Message::Nack(NackResponse {
            error: error.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub job: Job,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub queue: QueueName,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub job_id: JobId,
    pub error: String,
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryJobRequest {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckResponse {
    /// Job returned by Fetch and QueryJob
    pub job: Option<Job>,
    /// Id of the job stored by Enqueue
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackResponse {
    pub error: String,
}
