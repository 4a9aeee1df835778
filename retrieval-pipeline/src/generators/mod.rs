pub mod fts;
pub mod memory;
pub mod symbol;
pub mod vector;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use common::{
    error::PampaxError,
    storage::{db::SqliteStore, types::policy_row::PolicyDecision, SearchFilter},
    utils::embedding::EmbeddingProvider,
};

use crate::{intent::IntentResult, ReasonCategory, ReasonSeverity, StoppingReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Fts,
    Vector,
    Memory,
    Symbol,
    Graph,
}

impl CandidateSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fts => "fts",
            Self::Vector => "vector",
            Self::Memory => "memory",
            Self::Symbol => "symbol",
            Self::Graph => "graph",
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked hit from one source. For the memory source `chunk_id` holds
/// the memory-item id; hydration resolves it by source.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRef {
    pub chunk_id: String,
    pub source: CandidateSource,
    pub raw_score: f32,
    /// 1-based rank within the source's own ordering.
    pub rank_in_source: usize,
}

/// Everything a generator may consult. Borrowed for the duration of the
/// fan-out only.
pub struct GeneratorContext<'a> {
    pub store: &'a SqliteStore,
    pub query: &'a str,
    pub intent: &'a IntentResult,
    pub policy: &'a PolicyDecision,
    pub filter: &'a SearchFilter,
    pub session_id: Option<&'a str>,
    pub embedder: Option<&'a EmbeddingProvider>,
    pub embedding_model: &'a str,
}

#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    fn source(&self) -> CandidateSource;

    async fn generate(
        &self,
        ctx: &GeneratorContext<'_>,
        k: usize,
    ) -> Result<Vec<CandidateRef>, PampaxError>;
}

/// Run all generators concurrently with a per-generator deadline. A
/// generator that times out or fails contributes an empty list plus a
/// stopping reason; it never fails the pipeline.
pub async fn run_generators(
    generators: &[Arc<dyn CandidateGenerator>],
    ctx: &GeneratorContext<'_>,
    k: usize,
    per_generator_timeout: Duration,
    cancel: &CancellationToken,
) -> (
    Vec<(CandidateSource, Vec<CandidateRef>)>,
    Vec<StoppingReason>,
) {
    let mut futures = FuturesUnordered::new();
    for generator in generators {
        let generator = Arc::clone(generator);
        futures.push(async move {
            let source = generator.source();
            let outcome =
                tokio::time::timeout(per_generator_timeout, generator.generate(ctx, k)).await;
            (source, outcome)
        });
    }

    let mut lists = Vec::with_capacity(generators.len());
    let mut reasons = Vec::new();

    while let Some((source, outcome)) = futures.next().await {
        if cancel.is_cancelled() {
            reasons.push(
                StoppingReason::new(
                    ReasonCategory::Performance,
                    ReasonSeverity::Warning,
                    "candidate generation cancelled".to_string(),
                )
                .with_hint("retry without cancelling"),
            );
            lists.push((source, Vec::new()));
            continue;
        }
        match outcome {
            Ok(Ok(candidates)) => lists.push((source, candidates)),
            Ok(Err(err)) => {
                warn!(source = %source, error = %err, "Candidate generator failed");
                reasons.push(
                    StoppingReason::new(
                        ReasonCategory::Error,
                        ReasonSeverity::Warning,
                        format!("{source} generator failed: {err}"),
                    )
                    .with_hint("results may be missing one evidence source"),
                );
                lists.push((source, Vec::new()));
            }
            Err(_) => {
                warn!(source = %source, "Candidate generator timed out");
                reasons.push(
                    StoppingReason::new(
                        ReasonCategory::Performance,
                        ReasonSeverity::Warning,
                        format!(
                            "{source} generator exceeded {}ms",
                            per_generator_timeout.as_millis()
                        ),
                    )
                    .with_hint("raise timeouts.generator_ms or warm the store"),
                );
                lists.push((source, Vec::new()));
            }
        }
    }

    // Deterministic order for downstream fusion regardless of completion
    // order.
    lists.sort_by_key(|(source, _)| source.as_str());
    (lists, reasons)
}
