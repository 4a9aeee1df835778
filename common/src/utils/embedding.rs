use std::sync::Arc;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use fastembed::{InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::PampaxError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Backend actually wired at startup.
enum Backend {
    OpenAI(Client<OpenAIConfig>),
    FastEmbed(Arc<Mutex<TextEmbedding>>),
}

/// Query/document embedder. The vector generator treats this as an
/// external collaborator: when no provider is configured the generator
/// contributes nothing instead of failing.
pub struct EmbeddingProvider {
    backend: Backend,
    model: String,
    dimensions: u32,
}

impl EmbeddingProvider {
    /// Build the provider described by configuration. Returns `None` when
    /// embeddings are disabled.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>, PampaxError> {
        match config.embedding.backend {
            EmbeddingBackend::Disabled => Ok(None),
            EmbeddingBackend::OpenAI => {
                let api_key = config.embedding.api_key.clone().ok_or_else(|| {
                    PampaxError::InvalidInput(
                        "embedding.api_key is required for the openai backend".to_string(),
                    )
                })?;
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&config.embedding.base_url),
                );
                Ok(Some(Self {
                    backend: Backend::OpenAI(client),
                    model: config.embedding.model.clone(),
                    dimensions: config.embedding.dimensions,
                }))
            }
            EmbeddingBackend::FastEmbed => {
                let engine = TextEmbedding::try_new(InitOptions::default())
                    .map_err(|e| PampaxError::Unavailable(e.to_string()))?;
                info!("FastEmbed embedding backend initialized");
                Ok(Some(Self {
                    backend: Backend::FastEmbed(Arc::new(Mutex::new(engine))),
                    model: config.embedding.model.clone(),
                    dimensions: config.embedding.dimensions,
                }))
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimensions as usize
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::OpenAI(_) => "openai",
            Backend::FastEmbed(_) => "fastembed",
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, PampaxError> {
        match &self.backend {
            Backend::OpenAI(client) => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(&self.model)
                    .dimensions(self.dimensions)
                    .input([input])
                    .build()?;

                let response = client.embeddings().create(request).await?;
                let embedding = response
                    .data
                    .first()
                    .ok_or_else(|| {
                        PampaxError::Internal("no embedding data received".to_string())
                    })?
                    .embedding
                    .clone();

                debug!(dimensions = embedding.len(), "Embedding created");
                Ok(embedding)
            }
            Backend::FastEmbed(engine) => {
                let mut guard = engine.lock().await;
                let mut vectors = guard
                    .embed(vec![input], None)
                    .map_err(|e| PampaxError::Internal(e.to_string()))?;
                vectors
                    .pop()
                    .ok_or_else(|| PampaxError::Internal("empty embedding batch".to_string()))
            }
        }
    }
}
