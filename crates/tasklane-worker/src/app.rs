//! Wires settings and collaborators into a ready-to-start lifecycle.

use crate::collaborators::{
    Connection, Embedder, HuggingFaceEmbedder, LogMailer, Mailer, MemoryPlaceStore, PlaceStore,
};
use crate::config::Settings;
use crate::handlers::{AiHandlers, EmailHandlers};
use crate::lifecycle::Lifecycle;
use crate::pool::WorkerPool;
use crate::publisher::{PublisherConfig, TaskPublisher};
use crate::router::{QueueRouter, RouterTable};
use crate::scheduler::{publish_task, CronConfig, CronScheduler};

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tasklane_client::broker_from_url_with_sweep;
use tasklane_core::{AiTask, EmailTask};
use tracing::info;

/// External systems used by the handlers
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Mailer>,
    pub places: Arc<dyn PlaceStore>,
    pub embedder: Arc<dyn Embedder>,
    /// Connected before startup and closed last
    pub connections: Vec<Arc<dyn Connection>>,
}

impl Collaborators {
    /// Default implementations: log mailer, in-process place store, Hugging Face embedder
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let places = Arc::new(MemoryPlaceStore::new());
        let embedder = HuggingFaceEmbedder::new(
            &settings.embedder.model,
            settings.embedder.resolve_token(),
            Duration::from_secs(settings.embedder.timeout_secs),
        )?;

        Ok(Collaborators {
            mailer: Arc::new(LogMailer::new()),
            places: places.clone(),
            embedder: Arc::new(embedder),
            connections: vec![places as Arc<dyn Connection>],
        })
    }
}

/// Build the lifecycle described by `settings`
pub fn build(settings: &Settings, collaborators: Collaborators) -> anyhow::Result<Lifecycle> {
    settings.validate()?;
    let registry = Arc::new(settings.queue_registry()?);
    let broker = broker_from_url_with_sweep(&settings.broker.url, settings.sweep_interval())
        .with_context(|| format!("Invalid broker url {}", settings.broker.url))?;

    let publisher = Arc::new(TaskPublisher::new(
        broker.clone(),
        registry.clone(),
        PublisherConfig {
            retention: settings.retention,
            retry: settings.retry,
            test_mode: settings.broker.test_mode,
        },
    ));

    let routers = RouterTable::new()
        .with(Arc::new(QueueRouter::<EmailTask, _>::new(Arc::new(
            EmailHandlers::new(collaborators.mailer.clone()),
        ))))
        .with(Arc::new(QueueRouter::<AiTask, _>::new(Arc::new(
            AiHandlers::new(collaborators.places.clone(), collaborators.embedder.clone()),
        ))));

    let workers = Arc::new(
        WorkerPool::new(
            broker.clone(),
            registry.clone(),
            routers,
            settings.generate_worker_id(),
        )
        .with_poll_interval(Duration::from_millis(settings.worker.poll_interval_ms)),
    );

    let scheduler = Arc::new(CronScheduler::new());
    for cron in &settings.crons {
        let queue = cron.task.queue();
        if !registry.contains(queue) {
            bail!("Cron {} publishes to unregistered queue {}", cron.name, queue);
        }
        scheduler.register(CronConfig::new(
            cron.name.clone(),
            cron.expression.clone(),
            cron.timezone,
            publish_task(publisher.clone(), cron.task.clone()),
        ));
    }

    info!(
        broker = %settings.broker.url,
        queues = ?registry.names().collect::<Vec<_>>(),
        crons = settings.crons.len(),
        "Background components configured"
    );

    Ok(Lifecycle::new(
        broker,
        collaborators.connections,
        publisher,
        workers,
        scheduler,
    ))
}
