use crate::{config::BrokerConfig, metrics::BrokerMetrics};
use tasklane_core::{Broker, BrokerError, MemoryBroker, QueueName};
use tasklane_protocol::{
    AckResponse, CompleteRequest, EnqueueRequest, FailRequest, FetchRequest, Message,
    MessageCodec, QueryJobRequest,
};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use chrono::Utc;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const METRICS_INTERVAL_SECS: u64 = 5;

/// TCP front-end over an in-memory job store
pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    store: Arc<MemoryBroker>,
    metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> anyhow::Result<Self> {
        let metrics = BrokerMetrics::new()?;
        let sweep_every = Duration::from_secs(config.retention.sweep_interval_secs.max(1));

        Ok(BrokerServer {
            config: Arc::new(config),
            store: Arc::new(MemoryBroker::with_sweep_interval(sweep_every)),
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(&addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Broker listening on {}", listener.local_addr()?);

        // Connecting the store also starts its retention sweeper.
        self.store.connect().await?;

        let server = self.clone();
        let metrics_loop = tokio::spawn(async move {
            server.metrics_loop().await;
        });

        // Accept connections
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("New connection from {}", peer);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down broker");
                    break;
                }
            }
        }

        let _ = metrics_loop.await;
        self.store.close().await?;

        Ok(())
    }

    /// Handle a client connection
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream, MessageCodec);
        let mut workers = HashSet::new();
        self.metrics.connections.inc();

        let result = async {
            loop {
                let next = tokio::select! {
                    next = framed.next() => next,
                    _ = self.shutdown.cancelled() => break,
                };

                match next {
                    Some(Ok(message)) => {
                        if let Message::Fetch(req) = &message {
                            if !workers.contains(&req.worker_id) {
                                workers.insert(req.worker_id.clone());
                            }
                        }
                        let response = self.handle_message(message).await;
                        framed.send(response).await?;
                    }
                    Some(Err(e)) => {
                        error!("Protocol error from {}: {}", peer, e);
                        break;
                    }
                    None => break,
                }
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        self.metrics.connections.dec();

        // Jobs still held by this connection's workers go back to their queues.
        for worker_id in &workers {
            let released = self.store.release_worker(worker_id);
            if released > 0 {
                warn!(worker_id = %worker_id, released, "Worker disconnected mid-job, jobs requeued");
            }
        }
        debug!("Connection from {} closed", peer);

        result
    }

    /// Handle a protocol message
    pub async fn handle_message(&self, message: Message) -> Message {
        let result = match message {
            Message::Enqueue(req) => self.handle_enqueue(req).await,
            Message::Fetch(req) => self.handle_fetch(req).await,
            Message::Complete(req) => self.handle_complete(req).await,
            Message::Fail(req) => self.handle_fail(req).await,
            Message::QueryJob(req) => self.handle_query_job(req).await,
            Message::Ack(_) | Message::Nack(_) => {
                Err(BrokerError::Protocol("Unsupported message type".to_string()))
            }
        };

        match result {
            Ok(response) => Message::Ack(response),
            Err(e) => {
                warn!("Request rejected: {}", e);
                Message::nack(e.to_string())
            }
        }
    }

    async fn handle_enqueue(&self, req: EnqueueRequest) -> Result<AckResponse, BrokerError> {
        let queue = req.job.queue;

        if self.store.waiting_len(queue) >= self.config.broker.queue_depth_threshold {
            return Err(BrokerError::Rejected(format!(
                "Queue depth threshold exceeded for {}",
                queue
            )));
        }

        let job_id = self.store.enqueue(req.job).await?;
        self.metrics.inc_jobs(queue, "enqueued");
        debug!(queue = %queue, job_id = %job_id, "Enqueued job");

        Ok(AckResponse {
            job: None,
            job_id: Some(job_id),
        })
    }

    async fn handle_fetch(&self, req: FetchRequest) -> Result<AckResponse, BrokerError> {
        let job = self.store.fetch(req.queue, &req.worker_id).await?;

        if let Some(job) = &job {
            debug!(queue = %req.queue, job_id = %job.id, worker_id = %req.worker_id, "Job claimed");
        }

        Ok(AckResponse { job, job_id: None })
    }

    async fn handle_complete(&self, req: CompleteRequest) -> Result<AckResponse, BrokerError> {
        self.store.complete(req.job_id).await?;

        if let Some(job) = self.store.get(&req.job_id) {
            let latency = (Utc::now() - job.created_at).num_milliseconds() as f64 / 1000.0;
            self.metrics.observe_latency(job.queue, latency);
            self.metrics.inc_jobs(job.queue, "completed");
        }

        Ok(AckResponse {
            job: None,
            job_id: Some(req.job_id),
        })
    }

    async fn handle_fail(&self, req: FailRequest) -> Result<AckResponse, BrokerError> {
        let retrying = req.retry_in.is_some();
        self.store.fail(req.job_id, req.error, req.retry_in).await?;

        if let Some(job) = self.store.get(&req.job_id) {
            let event = if retrying { "retried" } else { "failed" };
            self.metrics.inc_jobs(job.queue, event);
        }

        Ok(AckResponse {
            job: None,
            job_id: Some(req.job_id),
        })
    }

    async fn handle_query_job(&self, req: QueryJobRequest) -> Result<AckResponse, BrokerError> {
        let job = self.store.job(req.job_id).await?;
        Ok(AckResponse { job, job_id: None })
    }

    async fn metrics_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(METRICS_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = interval.tick() => self.update_queue_metrics(),
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    fn update_queue_metrics(&self) {
        for queue in QueueName::ALL {
            self.metrics.update_queue(queue, self.store.counts(queue));
        }
    }

    pub fn store(&self) -> &Arc<MemoryBroker> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Stop accepting connections and end background loops
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
