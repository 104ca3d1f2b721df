use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tasklane_core::Task;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::publisher::TaskPublisher;

pub type CronAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression `{expression}` for cron {name}: {message}")]
    InvalidExpression {
        name: String,
        expression: String,
        message: String,
    },

    #[error("{} cron(s) did not stop cleanly: {}", .0.len(), .0.join("; "))]
    Crons(Vec<String>),
}

/// A named, timezone-scoped, expression-triggered action
#[derive(Clone)]
pub struct CronConfig {
    pub name: String,
    pub expression: String,
    pub timezone: Tz,
    pub action: CronAction,
}

impl CronConfig {
    pub fn new<F>(name: impl Into<String>, expression: impl Into<String>, timezone: Tz, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        CronConfig {
            name: name.into(),
            expression: expression.into(),
            timezone,
            action: Arc::new(action),
        }
    }

    fn parse(&self) -> Result<Cron, SchedulerError> {
        Cron::new(&self.expression)
            .with_seconds_optional()
            .parse()
            .map_err(|e| SchedulerError::InvalidExpression {
                name: self.name.clone(),
                expression: self.expression.clone(),
                message: e.to_string(),
            })
    }
}

/// Action that publishes `task` on every trigger and logs failures
pub fn publish_task(publisher: Arc<TaskPublisher>, task: Task) -> impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move || {
        let publisher = publisher.clone();
        let task = task.clone();
        async move {
            let queue = task.queue();
            let name = task.name();
            if let Err(e) = publisher.enqueue(task).await {
                error!(queue = %queue, task = name, error = %e, "Scheduled publish failed");
            }
        }
        .boxed()
    }
}

/// Next trigger strictly after `after`, evaluated in `timezone`
pub fn next_fire(cron: &Cron, timezone: &Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(timezone);
    cron.find_next_occurrence(&local, false)
        .ok()
        .map(|next| next.with_timezone(&Utc))
}

struct Running {
    shutdown: CancellationToken,
    timers: Vec<(String, JoinHandle<()>)>,
    actions: TaskTracker,
}

/// Independent cron timers; shares nothing with the worker pool
#[derive(Default)]
pub struct CronScheduler {
    crons: Mutex<BTreeMap<String, CronConfig>>,
    running: Mutex<Option<Running>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cron; an existing entry with the same name is replaced.
    ///
    /// Takes effect on the next `start`.
    pub fn register(&self, config: CronConfig) {
        if let Some(previous) = self.crons.lock().insert(config.name.clone(), config) {
            debug!(cron = %previous.name, "Replaced cron registration");
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.crons.lock().keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Parse every entry, then start one timer per cron.
    ///
    /// Nothing starts if any expression is invalid. Starting twice is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let parsed = self
            .crons
            .lock()
            .values()
            .map(|config| config.parse().map(|cron| (config.clone(), cron)))
            .collect::<Result<Vec<_>, SchedulerError>>()?;

        let shutdown = CancellationToken::new();
        let actions = TaskTracker::new();
        let timers = parsed
            .into_iter()
            .map(|(config, cron)| {
                let name = config.name.clone();
                let handle = tokio::spawn(run_timer(config, cron, shutdown.clone(), actions.clone()));
                (name, handle)
            })
            .collect::<Vec<_>>();

        info!(crons = timers.len(), "Scheduler started");
        *running = Some(Running {
            shutdown,
            timers,
            actions,
        });
        Ok(())
    }

    /// Halt every timer and wait for actions already spawned
    pub async fn close(&self) -> Result<(), SchedulerError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.shutdown.cancel();

        let (names, handles): (Vec<_>, Vec<_>) = running.timers.into_iter().unzip();
        let results = join_all(handles).await;

        running.actions.close();
        running.actions.wait().await;

        let failures: Vec<String> = names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| format!("cron {} failed: {}", name, e)))
            .collect();

        info!("Scheduler stopped");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Crons(failures))
        }
    }
}

async fn run_timer(config: CronConfig, cron: Cron, shutdown: CancellationToken, actions: TaskTracker) {
    let mut from = Utc::now();

    loop {
        let Some(next) = next_fire(&cron, &config.timezone, from) else {
            warn!(cron = %config.name, "Cron has no upcoming trigger, stopping timer");
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.cancelled() => return,
        }

        debug!(cron = %config.name, at = %next, "Cron triggered");
        actions.spawn((config.action)());

        // A slow wake-up skips missed triggers instead of firing them in a burst.
        from = next.max(Utc::now());
    }
}
