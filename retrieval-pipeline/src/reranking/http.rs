use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use common::error::PampaxError;

use super::{RankedDocument, RerankDocument, RerankProvider};

const COHERE_ENDPOINT: &str = "https://api.cohere.com/v1/rerank";
const VOYAGE_ENDPOINT: &str = "https://api.voyageai.com/v1/rerank";

/// Cohere's hosted reranker. Unavailable without an API key.
pub struct CohereProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
}

#[derive(Deserialize)]
struct CohereResponse {
    results: Vec<CohereResult>,
}

#[derive(Deserialize)]
struct CohereResult {
    index: usize,
    relevance_score: f32,
}

impl CohereProvider {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl RerankProvider for CohereProvider {
    fn id(&self) -> &'static str {
        "api_cohere"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError> {
        let Some(api_key) = &self.api_key else {
            return Err(PampaxError::Unavailable("cohere api key missing".to_string()));
        };

        let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
        let response = self
            .client
            .post(COHERE_ENDPOINT)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": texts,
                "top_n": documents.len(),
            }))
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(PampaxError::RateLimited("cohere rerank".to_string()));
        }
        let response = response.error_for_status()?;
        let parsed: CohereResponse = response.json().await?;
        debug!(results = parsed.results.len(), "Cohere rerank complete");

        Ok(parsed
            .results
            .into_iter()
            .filter_map(|result| {
                documents.get(result.index).map(|document| RankedDocument {
                    doc_ref: document.doc_ref.clone(),
                    score: result.relevance_score,
                })
            })
            .collect())
    }
}

/// Voyage AI's hosted reranker. Unavailable without an API key.
pub struct VoyageProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
}

#[derive(Deserialize)]
struct VoyageResponse {
    data: Vec<VoyageResult>,
}

#[derive(Deserialize)]
struct VoyageResult {
    index: usize,
    relevance_score: f32,
}

impl VoyageProvider {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl RerankProvider for VoyageProvider {
    fn id(&self) -> &'static str {
        "api_voyage"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError> {
        let Some(api_key) = &self.api_key else {
            return Err(PampaxError::Unavailable("voyage api key missing".to_string()));
        };

        let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
        let response = self
            .client
            .post(VOYAGE_ENDPOINT)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": texts,
            }))
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(PampaxError::RateLimited("voyage rerank".to_string()));
        }
        let response = response.error_for_status()?;
        let parsed: VoyageResponse = response.json().await?;
        debug!(results = parsed.data.len(), "Voyage rerank complete");

        Ok(parsed
            .data
            .into_iter()
            .filter_map(|result| {
                documents.get(result.index).map(|document| RankedDocument {
                    doc_ref: document.doc_ref.clone(),
                    score: result.relevance_score,
                })
            })
            .collect())
    }
}
