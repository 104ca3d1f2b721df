use crate::ClientError;
use tasklane_core::{Broker, BrokerError, Job, JobId, QueueName};
use tasklane_protocol::{
    AckResponse, CompleteRequest, EnqueueRequest, FailRequest, FetchRequest, Message,
    MessageCodec, ProtocolError, QueryJobRequest,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type Connection = Framed<TcpStream, MessageCodec>;

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct Link {
    framed: Option<Connection>,
    /// Set by `connect`, cleared by `close`; a dropped stream is re-dialed while set
    open: bool,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            framed: None,
            open: false,
            backoff: MIN_RECONNECT_BACKOFF,
            retry_at: None,
        }
    }
}

/// Broker client speaking the framed TCP protocol of `tl-broker`.
///
/// Requests share one connection and run one at a time. When the broker
/// drops the connection, the next request dials again with exponential
/// backoff between failed attempts.
pub struct RemoteBroker {
    address: String,
    link: Mutex<Link>,
}

impl RemoteBroker {
    pub fn new(address: impl Into<String>) -> Self {
        RemoteBroker {
            address: address.into(),
            link: Mutex::new(Link::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn dial(&self) -> Result<Connection, BrokerError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| ClientError::ConnectionError(e.to_string()))?;
        Ok(Framed::new(stream, MessageCodec))
    }

    async fn reconnect(&self, link: &mut Link) -> Result<(), BrokerError> {
        if let Some(retry_at) = link.retry_at {
            if Instant::now() < retry_at {
                return Err(ClientError::ConnectionError(format!(
                    "Reconnect to {} backing off for {:?}",
                    self.address,
                    retry_at - Instant::now()
                ))
                .into());
            }
        }

        warn!("Reconnecting to broker at {}", self.address);
        match self.dial().await {
            Ok(framed) => {
                link.framed = Some(framed);
                link.backoff = MIN_RECONNECT_BACKOFF;
                link.retry_at = None;
                info!("Reconnected to broker at {}", self.address);
                Ok(())
            }
            Err(e) => {
                link.retry_at = Some(Instant::now() + link.backoff);
                link.backoff = (link.backoff * 2).min(MAX_RECONNECT_BACKOFF);
                Err(e)
            }
        }
    }

    /// Send one request and wait for its Ack
    async fn request(&self, message: Message) -> Result<AckResponse, BrokerError> {
        let mut link = self.link.lock().await;
        if !link.open {
            return Err(BrokerError::NotConnected);
        }
        if link.framed.is_none() {
            self.reconnect(&mut link).await?;
        }
        let framed = link.framed.as_mut().ok_or(BrokerError::NotConnected)?;

        let response = match framed.send(message).await {
            Ok(()) => framed.next().await,
            Err(e) => Some(Err(e)),
        };

        match response {
            Some(Ok(Message::Ack(ack))) => Ok(ack),
            Some(Ok(Message::Nack(nack))) => Err(ClientError::ServerError(nack.error).into()),
            Some(Ok(other)) => Err(ClientError::ProtocolError(format!(
                "Unexpected response: {:?}",
                other.message_type()
            ))
            .into()),
            Some(Err(e)) => {
                // The stream is unusable after a codec error.
                warn!("Dropping broker connection to {}: {}", self.address, e);
                link.framed = None;
                let err = match e {
                    ProtocolError::IoError(io) => ClientError::ConnectionError(io.to_string()),
                    other => ClientError::ProtocolError(other.to_string()),
                };
                Err(err.into())
            }
            None => {
                warn!("Broker at {} closed the connection", self.address);
                link.framed = None;
                Err(ClientError::ConnectionError("Connection closed".to_string()).into())
            }
        }
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        if link.open && link.framed.is_some() {
            return Ok(());
        }

        let framed = self.dial().await?;
        *link = Link {
            framed: Some(framed),
            open: true,
            ..Link::default()
        };

        info!("Connected to broker at {}", self.address);
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        let job_id = job.id;
        let ack = self.request(Message::Enqueue(EnqueueRequest { job })).await?;
        Ok(ack.job_id.unwrap_or(job_id))
    }

    async fn fetch(&self, queue: QueueName, worker_id: &str) -> Result<Option<Job>, BrokerError> {
        let ack = self
            .request(Message::Fetch(FetchRequest {
                queue,
                worker_id: worker_id.to_string(),
            }))
            .await?;
        Ok(ack.job)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.request(Message::Complete(CompleteRequest { job_id }))
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: String,
        retry_in: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.request(Message::Fail(FailRequest {
            job_id,
            error,
            retry_in,
        }))
        .await?;
        Ok(())
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        let ack = self
            .request(Message::QueryJob(QueryJobRequest { job_id }))
            .await?;
        Ok(ack.job)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        link.open = false;
        if let Some(mut framed) = link.framed.take() {
            if let Err(e) = framed.close().await {
                debug!("Error while closing broker connection: {}", e);
            }
            info!("Disconnected from broker at {}", self.address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        let broker = RemoteBroker::new("127.0.0.1:1");
        let result = broker.fetch(QueueName::Emails, "w").await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_dropped_connection_backs_off_between_dials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = RemoteBroker::new(listener.local_addr().unwrap().to_string());

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        broker.connect().await.unwrap();
        // Listener and accepted stream are both gone once this returns.
        accept.await.unwrap();

        assert!(matches!(
            broker.fetch(QueueName::Emails, "w").await,
            Err(BrokerError::Connection(_))
        ));
        // Re-dial is refused, which arms the backoff.
        assert!(matches!(
            broker.fetch(QueueName::Emails, "w").await,
            Err(BrokerError::Connection(_))
        ));
        match broker.fetch(QueueName::Emails, "w").await {
            Err(BrokerError::Connection(message)) => assert!(message.contains("backing off")),
            other => panic!("Expected a backoff error, got {:?}", other),
        }

        let link = broker.link.lock().await;
        assert!(link.open);
        assert_eq!(link.backoff, MIN_RECONNECT_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let broker = RemoteBroker::new("127.0.0.1:1");
        assert!(broker.close().await.is_ok());
    }
}
