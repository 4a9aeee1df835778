use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, StreamExt};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use common::{
    error::PampaxError,
    storage::{
        db::SqliteStore,
        types::{chunk::Chunk, reference::EdgeKind, reference::Reference, span::Span},
    },
    tokenizer::TokenizerFactory,
};

/// Seed handed to the expander: a span plus its fused score.
#[derive(Debug, Clone)]
pub struct SeedSpan {
    pub span_id: String,
    pub score: f32,
}

/// A span reached by the walk, with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub span_id: String,
    /// First rendered chunk for the span, if one exists.
    pub chunk_id: Option<String>,
    pub depth: u8,
    pub via: EdgeKind,
    pub from_span_id: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub src_span_id: String,
    pub dst_span_id: String,
    pub kind: EdgeKind,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphExpansion {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub depth_reached: u8,
    pub tokens_used: usize,
    pub truncated: bool,
    pub performance_ms: u128,
    pub cache_hit: bool,
}

/// Neighbor ordering within a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionMode {
    /// Edge-confidence first.
    Quality,
    /// Insertion order.
    Breadth,
}

struct CachedExpansion {
    expansion: GraphExpansion,
    at: Instant,
    generation: u64,
}

/// Depth is capped at 2 regardless of what the policy asks for.
pub const DEPTH_CAP: u8 = 2;

/// BFS over reference edges under a token guard. Results are cached per
/// `(seeds, depth, kinds, budget bucket)` for a short TTL; any store write
/// invalidates cached entries via the write-generation counter.
pub struct GraphExpander {
    cache: Mutex<LruCache<String, CachedExpansion>>,
    ttl: Duration,
    fanout: usize,
    mode: ExpansionMode,
}

impl GraphExpander {
    pub fn new(cache_capacity: usize, ttl: Duration, fanout: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            fanout: fanout.max(1),
            mode: ExpansionMode::Quality,
        }
    }

    pub fn with_mode(mut self, mode: ExpansionMode) -> Self {
        self.mode = mode;
        self
    }

    fn cache_key(seeds: &[SeedSpan], depth: u8, allowed: &[EdgeKind], budget: usize) -> String {
        let mut ids: Vec<&str> = seeds.iter().map(|s| s.span_id.as_str()).collect();
        ids.sort_unstable();
        let mut kinds: Vec<&str> = allowed.iter().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        format!(
            "{}|{}|{}|{}",
            ids.join(","),
            depth,
            kinds.join(","),
            budget / 1024
        )
    }

    #[instrument(skip_all, fields(seeds = seeds.len(), max_depth))]
    pub async fn expand(
        &self,
        store: &SqliteStore,
        tokenizers: &TokenizerFactory,
        model: &str,
        seeds: &[SeedSpan],
        max_depth: u8,
        token_budget: usize,
        allowed: &[EdgeKind],
        cancel: &CancellationToken,
    ) -> Result<GraphExpansion, PampaxError> {
        let started = Instant::now();
        let depth_limit = max_depth.min(DEPTH_CAP);
        let key = Self::cache_key(seeds, depth_limit, allowed, token_budget);
        let generation = store.write_generation();

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                if cached.at.elapsed() < self.ttl && cached.generation == generation {
                    let mut expansion = cached.expansion.clone();
                    expansion.cache_hit = true;
                    expansion.performance_ms = started.elapsed().as_millis();
                    return Ok(expansion);
                }
                cache.pop(&key);
            }
        }

        let mut visited: HashSet<String> = seeds.iter().map(|s| s.span_id.clone()).collect();
        let mut edges_seen: HashSet<(String, String, EdgeKind)> = HashSet::new();
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut tokens_used = 0usize;
        let mut truncated = false;
        let mut depth_reached = 0u8;

        let mut frontier: Vec<String> = seeds.iter().map(|s| s.span_id.clone()).collect();

        for depth in 1..=depth_limit {
            if frontier.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(PampaxError::Cancelled("graph expansion".to_string()));
            }

            // Fetch each frontier node's edges concurrently; merge in a
            // deterministic order afterwards.
            let mut fetches = FuturesUnordered::new();
            for span_id in &frontier {
                let span_id = span_id.clone();
                fetches.push(async move {
                    let outgoing = Reference::outgoing(&span_id, Some(allowed), store).await;
                    let incoming = Reference::incoming(&span_id, Some(allowed), store).await;
                    (span_id, outgoing, incoming)
                });
            }

            let mut wave: Vec<(String, Vec<(Reference, Span, bool)>)> = Vec::new();
            while let Some((span_id, outgoing, incoming)) = fetches.next().await {
                let mut neighbors: Vec<(Reference, Span, bool)> = Vec::new();
                for (reference, dst) in outgoing? {
                    if let Some(dst) = dst {
                        neighbors.push((reference, dst, true));
                    }
                }
                for (reference, src) in incoming? {
                    neighbors.push((reference, src, false));
                }
                wave.push((span_id, neighbors));
            }
            wave.sort_by(|a, b| a.0.cmp(&b.0));

            let mut next_frontier: Vec<String> = Vec::new();
            for (from_span_id, mut neighbors) in wave {
                if self.mode == ExpansionMode::Quality {
                    neighbors.sort_by(|a, b| {
                        b.0.confidence
                            .partial_cmp(&a.0.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.1.span_id.cmp(&b.1.span_id))
                    });
                }

                let mut taken = 0usize;
                for (reference, neighbor, outward) in neighbors {
                    if taken >= self.fanout {
                        break;
                    }

                    let (src, dst) = if outward {
                        (from_span_id.clone(), neighbor.span_id.clone())
                    } else {
                        (neighbor.span_id.clone(), from_span_id.clone())
                    };
                    if edges_seen.insert((src.clone(), dst.clone(), reference.kind)) {
                        edges.push(GraphEdge {
                            src_span_id: src,
                            dst_span_id: dst,
                            kind: reference.kind,
                            confidence: reference.confidence,
                        });
                    }

                    if visited.contains(&neighbor.span_id) {
                        continue;
                    }

                    let chunk = Chunk::first_for_span(&neighbor.span_id, store).await?;
                    let estimate = chunk
                        .as_ref()
                        .map(|c| tokenizers.count(model, &c.content).count)
                        .unwrap_or(0);

                    // Token guard: skip anything that would overrun.
                    if tokens_used + estimate > token_budget {
                        truncated = true;
                        continue;
                    }

                    tokens_used += estimate;
                    visited.insert(neighbor.span_id.clone());
                    nodes.push(GraphNode {
                        span_id: neighbor.span_id.clone(),
                        chunk_id: chunk.map(|c| c.chunk_id),
                        depth,
                        via: reference.kind,
                        from_span_id: from_span_id.clone(),
                        confidence: reference.confidence,
                    });
                    next_frontier.push(neighbor.span_id);
                    depth_reached = depth;
                    taken += 1;
                }
            }

            frontier = next_frontier;
        }

        let expansion = GraphExpansion {
            nodes,
            edges,
            depth_reached,
            tokens_used,
            truncated,
            performance_ms: started.elapsed().as_millis(),
            cache_hit: false,
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CachedExpansion {
                    expansion: expansion.clone(),
                    at: Instant::now(),
                    generation,
                },
            );
        }

        debug!(
            nodes = expansion.nodes.len(),
            edges = expansion.edges.len(),
            tokens = expansion.tokens_used,
            truncated = expansion.truncated,
            "Graph expansion complete"
        );
        Ok(expansion)
    }
}
