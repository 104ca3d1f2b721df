//! Publish-to-completion scenarios through the full lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tasklane_broker::{BrokerConfig, BrokerServer};
use tasklane_core::{Broker, JobId, JobState, NewsletterData, PlaceEmbeddingData};
use tasklane_worker::collaborators::{Connection, Embedder, LogMailer, MemoryPlaceStore, Place};
use tasklane_worker::{build, Collaborators, Lifecycle, Settings};

struct StubEmbedder;

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![text.len() as f32])
    }
}

struct Harness {
    lifecycle: Lifecycle,
    mailer: Arc<LogMailer>,
    places: Arc<MemoryPlaceStore>,
}

fn harness(settings: &Settings) -> Harness {
    let mailer = Arc::new(LogMailer::new());
    let places = Arc::new(MemoryPlaceStore::new());
    let collaborators = Collaborators {
        mailer: mailer.clone(),
        places: places.clone(),
        embedder: Arc::new(StubEmbedder),
        connections: vec![places.clone() as Arc<dyn Connection>],
    };

    let lifecycle = build(settings, collaborators).unwrap();
    Harness {
        lifecycle,
        mailer,
        places,
    }
}

async fn start_server() -> (Arc<BrokerServer>, Settings) {
    let server = Arc::new(BrokerServer::new(BrokerConfig::default()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.run_with_listener(listener).await });

    let mut settings = Settings::default();
    settings.broker.url = format!("tcp://{}", addr);
    settings.worker.poll_interval_ms = 10;
    (server, settings)
}

async fn wait_for_terminal(server: &BrokerServer, job_id: JobId) -> JobState {
    for _ in 0..300 {
        if let Some(job) = server.store().get(&job_id) {
            if job.state.is_terminal() {
                return job.state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Job {} never finished", job_id);
}

#[tokio::test]
async fn test_newsletter_completes() {
    let (server, settings) = start_server().await;
    let h = harness(&settings);
    h.lifecycle.start_all().await.unwrap();

    let job_id = h
        .lifecycle
        .publisher()
        .enqueue(NewsletterData {
            name: "Slim".to_string(),
            email: "slim@example.com".to_string(),
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(wait_for_terminal(&server, job_id).await, JobState::Completed);
    assert_eq!(
        h.mailer.sent(),
        vec![("Slim".to_string(), "slim@example.com".to_string())]
    );

    h.lifecycle.close_all().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_missing_place_fails_and_is_purged_after_retention() {
    let (server, settings) = start_server().await;
    let h = harness(&settings);
    h.places.insert(Place {
        id: 1,
        title: "Carthage".to_string(),
        description: "Ruins".to_string(),
        embedding: None,
    });
    h.lifecycle.start_all().await.unwrap();

    let publisher = h.lifecycle.publisher();
    let found = publisher.enqueue(PlaceEmbeddingData { place_id: 1 }).await.unwrap().unwrap();
    let missing = publisher.enqueue(PlaceEmbeddingData { place_id: 404 }).await.unwrap().unwrap();

    assert_eq!(wait_for_terminal(&server, found).await, JobState::Completed);
    assert_eq!(wait_for_terminal(&server, missing).await, JobState::Failed);
    assert_eq!(
        h.places.get(1).unwrap().embedding,
        Some(vec!["Carthage - Ruins".len() as f32])
    );

    let failed = server.store().get(&missing).unwrap();
    assert_eq!(failed.attempts, 1);
    assert!(failed.error.unwrap_or_default().contains("Place 404 not found"));

    let finished = failed.finished_at.unwrap();
    assert_eq!(server.store().purge_expired(finished + chrono::Duration::days(6)), 0);
    assert_eq!(server.store().purge_expired(finished + chrono::Duration::days(8)), 2);
    assert!(server.store().get(&missing).is_none());

    h.lifecycle.close_all().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_task_name_fails_job() {
    let (server, settings) = start_server().await;
    let h = harness(&settings);
    h.lifecycle.start_all().await.unwrap();

    let job_id = h
        .lifecycle
        .publisher()
        .enqueue_raw("emails", "digest", br#"{"name":"Ana","email":"ana@x.com"}"#.to_vec())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(wait_for_terminal(&server, job_id).await, JobState::Failed);
    assert!(h.mailer.sent().is_empty());

    h.lifecycle.close_all().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_test_mode_publishes_nothing() {
    let mut settings = Settings::default();
    settings.broker.test_mode = true;
    let h = harness(&settings);
    h.lifecycle.start_all().await.unwrap();

    let result = h
        .lifecycle
        .publisher()
        .enqueue(NewsletterData {
            name: "Ana".to_string(),
            email: "ana@x.com".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(result, None);

    h.lifecycle.close_all().await.unwrap();
}

#[tokio::test]
async fn test_memory_broker_purges_after_retention() {
    let mut settings = Settings::default();
    settings.broker.sweep_interval_secs = 1;
    settings.retention.remove_on_complete_secs = 1;
    settings.retention.remove_on_fail_secs = 1;
    settings.worker.poll_interval_ms = 10;

    let h = harness(&settings);
    h.lifecycle.start_all().await.unwrap();

    let job_id = h
        .lifecycle
        .publisher()
        .enqueue(NewsletterData {
            name: "Iris".to_string(),
            email: "iris@x.com".to_string(),
        })
        .await
        .unwrap()
        .unwrap();

    let broker = h.lifecycle.broker();
    let mut purged = false;
    for _ in 0..100 {
        if broker.job(job_id).await.unwrap().is_none() {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(purged, "job {} outlived its retention", job_id);
    assert_eq!(h.mailer.sent().len(), 1);
    h.lifecycle.close_all().await.unwrap();
}
