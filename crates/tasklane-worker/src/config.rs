use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasklane_core::{QueueName, QueueRegistry, QueueSpec, RetentionPolicy, RetryPolicy, Task, TaskError};
use thiserror::Error;

/// Environment variable read when `embedder.api_token` is not set
pub const HF_TOKEN_ENV: &str = "HF_API_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid queue configuration: {0}")]
    Queue(#[from] TaskError),

    #[error("Invalid retention configuration: {0}")]
    Retention(#[source] TaskError),
}

/// Worker process settings, loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub queues: Vec<QueueSettings>,
    /// Default retention applied to every published job
    pub retention: RetentionPolicy,
    /// Default retry policy applied to every published job
    pub retry: RetryPolicy,
    pub worker: WorkerSettings,
    pub crons: Vec<CronSettings>,
    pub embedder: EmbedderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `memory://` or `tcp://host:port`
    pub url: String,
    /// Publishing becomes a no-op returning no job id
    pub test_mode: bool,
    /// Retention sweep period of the in-process `memory://` broker
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub worker_id: Option<String>,
    /// Sleep between fetches when a queue is empty
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSettings {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    /// Task published on every trigger
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    pub api_token: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            broker: BrokerSettings::default(),
            queues: QueueName::ALL
                .iter()
                .map(|name| QueueSettings {
                    name: name.to_string(),
                    concurrency: default_concurrency(),
                })
                .collect(),
            retention: RetentionPolicy::default(),
            retry: RetryPolicy::default(),
            worker: WorkerSettings::default(),
            crons: Vec::new(),
            embedder: EmbedderSettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            url: "memory://".to_string(),
            test_mode: false,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            worker_id: None,
            poll_interval_ms: 500,
        }
    }
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        EmbedderSettings {
            api_token: None,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject retention ages too large to represent as a deadline
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retention.validate().map_err(ConfigError::Retention)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.broker.sweep_interval_secs.max(1))
    }

    /// Build the queue registry. Unknown queue names are rejected here, at startup.
    pub fn queue_registry(&self) -> Result<QueueRegistry, ConfigError> {
        let specs = self
            .queues
            .iter()
            .map(|q| {
                let name: QueueName = q.name.parse()?;
                Ok(QueueSpec::new(name).with_concurrency(q.concurrency))
            })
            .collect::<Result<Vec<_>, TaskError>>()?;

        Ok(QueueRegistry::new(specs)?)
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = std::process::id();
        let random = uuid::Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }
}

impl EmbedderSettings {
    /// Configured token, falling back to the environment
    pub fn resolve_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var(HF_TOKEN_ENV).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tasklane_core::{EmailTask, NewsletterData};

    #[test]
    fn test_defaults_register_every_queue() {
        let registry = Settings::default().queue_registry().unwrap();
        assert!(registry.contains(QueueName::Emails));
        assert!(registry.contains(QueueName::Ai));
        assert_eq!(Settings::default().retry.max_attempts, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
broker:
  url: tcp://127.0.0.1:6380
queues:
  - name: emails
    concurrency: 2
retry:
  max_attempts: 3
crons:
  - name: hourly-newsletter
    expression: "0 * * * *"
    timezone: Africa/Tunis
    task:
      emails:
        newsletter:
          name: Slim
          email: slim@example.com
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.broker.url, "tcp://127.0.0.1:6380");
        assert!(!settings.broker.test_mode);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay_secs, 5);
        assert_eq!(settings.retention, RetentionPolicy::default());

        let registry = settings.queue_registry().unwrap();
        assert_eq!(registry.concurrency(QueueName::Emails), Some(2));
        assert!(!registry.contains(QueueName::Ai));

        let cron = &settings.crons[0];
        assert_eq!(cron.timezone, chrono_tz::Africa::Tunis);
        assert_eq!(
            cron.task,
            Task::Emails(EmailTask::Newsletter(NewsletterData {
                name: "Slim".to_string(),
                email: "slim@example.com".to_string(),
            }))
        );
    }

    #[test]
    fn test_unknown_queue_is_config_error() {
        let settings = Settings {
            queues: vec![QueueSettings {
                name: "reports".to_string(),
                concurrency: 1,
            }],
            ..Settings::default()
        };

        assert!(matches!(
            settings.queue_registry(),
            Err(ConfigError::Queue(TaskError::UnknownQueue(_)))
        ));
    }

    #[test]
    fn test_out_of_range_retention_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "retention:\n  remove_on_complete_secs: 18446744073709551615\n"
        )
        .unwrap();

        assert!(matches!(
            Settings::from_file(file.path().to_str().unwrap()),
            Err(ConfigError::Retention(TaskError::InvalidRetention { .. }))
        ));

        let mut settings = Settings::default();
        settings.retention.remove_on_fail_secs = tasklane_core::MAX_RETENTION_SECS + 1;
        assert!(matches!(settings.validate(), Err(ConfigError::Retention(_))));
    }

    #[test]
    fn test_explicit_worker_id_wins() {
        let mut settings = Settings::default();
        settings.worker.worker_id = Some("worker-7".to_string());
        assert_eq!(settings.generate_worker_id(), "worker-7");
    }
}
