use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use common::error::PampaxError;

use super::{RankedDocument, RerankDocument, RerankProvider};

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

struct EnginePool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

/// Quantized cross-encoder running in-process. A small engine pool behind
/// a semaphore bounds parallel reranks; initialization failure degrades to
/// an unavailable provider rather than an error.
pub struct LocalCrossEncoder {
    pool: Option<EnginePool>,
}

impl LocalCrossEncoder {
    pub fn initialize(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let mut engines = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            debug!(index, "Creating local rerank engine");
            match TextRerank::try_new(RerankInitOptions::default()) {
                Ok(engine) => engines.push(Arc::new(Mutex::new(engine))),
                Err(err) => {
                    warn!(error = %err, "Local cross-encoder unavailable");
                    return Self::disabled();
                }
            }
        }
        Self {
            pool: Some(EnginePool {
                semaphore: Arc::new(Semaphore::new(engines.len())),
                engines,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { pool: None }
    }
}

#[async_trait]
impl RerankProvider for LocalCrossEncoder {
    fn id(&self) -> &'static str {
        "local_cross_encoder"
    }

    fn is_available(&self) -> bool {
        self.pool.is_some()
    }

    fn models(&self) -> Vec<String> {
        vec!["bge-reranker-base".to_string()]
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError> {
        let Some(pool) = &self.pool else {
            return Err(PampaxError::Unavailable(
                "local cross-encoder is not initialized".to_string(),
            ));
        };

        let _permit = Arc::clone(&pool.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PampaxError::Unavailable("rerank pool closed".to_string()))?;

        let index = pick_engine_index(pool.engines.len());
        let engine = Arc::clone(&pool.engines[index]);

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let mut guard = engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), texts, false, None)
            .map_err(|e| PampaxError::Internal(e.to_string()))?;

        let mut ranking = Vec::with_capacity(results.len());
        for result in results {
            let Some(document) = documents.get(result.index) else {
                warn!(result_index = result.index, "Reranker returned out-of-range index; skipping");
                continue;
            };
            ranking.push(RankedDocument {
                doc_ref: document.doc_ref.clone(),
                score: result.score,
            });
        }
        Ok(ranking)
    }
}
