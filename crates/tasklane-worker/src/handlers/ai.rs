use crate::collaborators::{Embedder, PlaceStore};
use crate::router::TaskHandler;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::sync::Arc;
use tasklane_core::{AiTask, PlaceEmbeddingData};
use tracing::debug;

pub struct AiHandlers {
    places: Arc<dyn PlaceStore>,
    embedder: Arc<dyn Embedder>,
}

impl AiHandlers {
    pub fn new(places: Arc<dyn PlaceStore>, embedder: Arc<dyn Embedder>) -> Self {
        AiHandlers { places, embedder }
    }

    async fn place_embedding(&self, data: PlaceEmbeddingData) -> anyhow::Result<()> {
        let place = self
            .places
            .get_place(data.place_id)
            .await
            .with_context(|| format!("Could not load place {}", data.place_id))?
            .ok_or_else(|| anyhow!("Place {} not found", data.place_id))?;

        let text = format!("{} - {}", place.title, place.description);
        let embedding = self
            .embedder
            .embed_text(&text)
            .await
            .with_context(|| format!("Could not embed place {}", place.id))?;

        debug!(place_id = place.id, dimensions = embedding.len(), "Place embedded");

        self.places
            .set_embedding(place.id, embedding)
            .await
            .with_context(|| format!("Could not store embedding of place {}", place.id))
    }
}

#[async_trait]
impl TaskHandler<AiTask> for AiHandlers {
    async fn handle(&self, task: AiTask) -> anyhow::Result<()> {
        match task {
            AiTask::PlaceEmbedding(data) => self.place_embedding(data).await,
        }
    }
}
