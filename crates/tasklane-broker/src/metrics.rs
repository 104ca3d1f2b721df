use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tasklane_core::{QueueCounts, QueueName};

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    // Job counters
    pub jobs_total: IntCounterVec,

    // Queue depth by state
    pub queue_jobs: IntGaugeVec,

    // Time from enqueue to completion
    pub job_latency: HistogramVec,

    pub connections: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("tl_jobs_total", "Total number of job events by queue and outcome"),
            &["queue", "event"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let queue_jobs = IntGaugeVec::new(
            Opts::new("tl_queue_jobs", "Jobs currently held per queue and state"),
            &["queue", "state"],
        )?;
        registry.register(Box::new(queue_jobs.clone()))?;

        let job_latency = HistogramVec::new(
            HistogramOpts::new(
                "tl_job_latency_seconds",
                "Seconds between enqueue and completion",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(job_latency.clone()))?;

        let connections = IntGauge::new("tl_connections", "Open client connections")?;
        registry.register(Box::new(connections.clone()))?;

        Ok(BrokerMetrics {
            registry,
            jobs_total,
            queue_jobs,
            job_latency,
            connections,
        })
    }

    /// Increment a job event counter ("enqueued", "completed", "failed", "retried")
    pub fn inc_jobs(&self, queue: QueueName, event: &str) {
        self.jobs_total
            .with_label_values(&[queue.as_str(), event])
            .inc();
    }

    /// Record enqueue-to-completion latency
    pub fn observe_latency(&self, queue: QueueName, seconds: f64) {
        self.job_latency
            .with_label_values(&[queue.as_str()])
            .observe(seconds);
    }

    /// Update queue depth gauges
    pub fn update_queue(&self, queue: QueueName, counts: QueueCounts) {
        let q = queue.as_str();
        self.queue_jobs.with_label_values(&[q, "waiting"]).set(counts.waiting as i64);
        self.queue_jobs.with_label_values(&[q, "active"]).set(counts.active as i64);
        self.queue_jobs.with_label_values(&[q, "completed"]).set(counts.completed as i64);
        self.queue_jobs.with_label_values(&[q, "failed"]).set(counts.failed as i64);
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
