//! External systems the handlers talk to.
//!
//! Each is a small trait so handlers can be exercised against in-process
//! implementations; the binaries wire in the ones below.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const HF_ROUTER_URL: &str = "https://router.huggingface.co/hf-inference/models";

/// Something the lifecycle connects before starting and disconnects last
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_newsletter(&self, name: &str, email: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: u64,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[async_trait]
pub trait PlaceStore: Send + Sync {
    async fn get_place(&self, id: u64) -> anyhow::Result<Option<Place>>;

    async fn set_embedding(&self, id: u64, embedding: Vec<f32>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Mailer that records deliveries in the log
#[derive(Default)]
pub struct LogMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (name, email) of every newsletter sent so far
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send_newsletter(&self, name: &str, email: &str) -> anyhow::Result<()> {
        info!(name, email, "Sending newsletter");
        self.sent.lock().push((name.to_string(), email.to_string()));
        Ok(())
    }
}

/// In-process place table; doubles as the database connection.
#[derive(Default)]
pub struct MemoryPlaceStore {
    places: RwLock<HashMap<u64, Place>>,
    connected: AtomicBool,
}

impl MemoryPlaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, place: Place) {
        self.places.write().insert(place.id, place);
    }

    pub fn get(&self, id: u64) -> Option<Place> {
        self.places.read().get(&id).cloned()
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("Place store is not connected"))
        }
    }
}

#[async_trait]
impl PlaceStore for MemoryPlaceStore {
    async fn get_place(&self, id: u64) -> anyhow::Result<Option<Place>> {
        self.ensure_connected()?;
        Ok(self.get(id))
    }

    async fn set_embedding(&self, id: u64, embedding: Vec<f32>) -> anyhow::Result<()> {
        self.ensure_connected()?;
        let mut places = self.places.write();
        let place = places
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Place {} not found", id))?;
        place.embedding = Some(embedding);
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryPlaceStore {
    fn name(&self) -> &str {
        "places"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("Place store connected");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Place store closed");
        Ok(())
    }
}

/// Feature-extraction client for the Hugging Face inference router
pub struct HuggingFaceEmbedder {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a str,
}

impl HuggingFaceEmbedder {
    pub fn new(model: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HuggingFaceEmbedder {
            client,
            url: format!("{}/{}/pipeline/feature-extraction", HF_ROUTER_URL, model),
            token,
        })
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut request = self.client.post(&self.url).json(&EmbedRequest { inputs: text });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Embedding request failed")?
            .error_for_status()
            .context("Embedding service returned an error")?;

        let embedding = response
            .json::<Vec<f32>>()
            .await
            .context("Unexpected embedding response")?;

        Ok(embedding)
    }
}
