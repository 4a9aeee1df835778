use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use common::{
    error::PampaxError,
    storage::types::{
        chunk::Chunk,
        interaction::{Interaction, PolicyThresholds},
        memory_item::MemoryItem,
        packing_profile::PackingProfile,
        reference::EdgeKind,
        search_log::SearchLog,
        session::Session,
        span::Span,
    },
};

use crate::{
    fusion::FusedCandidate,
    generators::{run_generators, CandidateGenerator, CandidateSource, GeneratorContext},
    graph::SeedSpan,
    packing::PackCandidate,
    policy::{validate, PolicyRow, SearchContext},
    reranking::RerankDocument,
    signature::SignatureCache,
    Bundle, ReasonCategory, ReasonSeverity, StoppingReason,
};

use super::{PipelineContext, StageKind};

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[derive(Debug, Clone, Copy)]
pub struct ClassifyStage;

#[async_trait]
impl PipelineStage for ClassifyStage {
    fn kind(&self) -> StageKind {
        StageKind::Classify
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        let mut result = ctx
            .pipeline
            .classifier()
            .classify(&ctx.request.query, None)?;
        if let Some(overridden) = ctx.request.intent_override {
            result.intent = overridden;
            result.confidence = 1.0;
        }
        debug!(intent = %result.intent, confidence = result.confidence, "Query classified");
        ctx.intent = Some(result);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateStage;

#[async_trait]
impl PipelineStage for GateStage {
    fn kind(&self) -> StageKind {
        StageKind::Gate
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        let intent = ctx.intent_result()?.clone();

        // Learned, repo-scoped policy rows replace the built-in default as
        // the base when they validate.
        let repo_key = ctx.request.repo.clone().unwrap_or_else(|| "*".to_string());
        let stored = match PolicyRow::get(&repo_key, intent.intent.as_str(), ctx.pipeline.store())
            .await
        {
            Ok(Some(row)) => match validate(&row.decision) {
                Ok(()) => Some(row.decision),
                Err(err) => {
                    warn!(error = %err, "Stored policy row rejected; using defaults");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "Policy row lookup failed; using defaults");
                None
            }
        };

        let search_ctx = SearchContext {
            repo: ctx.request.repo.clone(),
            language: ctx.request.language.clone(),
            query_length: ctx.request.query.chars().count(),
            budget: Some(ctx.budget),
        };
        let decision = ctx.pipeline.gate().decide(&intent, &search_ctx, stored)?;
        ctx.policy = Some(decision);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureLookupStage;

#[async_trait]
impl PipelineStage for SignatureLookupStage {
    fn kind(&self) -> StageKind {
        StageKind::SignatureLookup
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if !ctx.pipeline.config().features.signature_cache {
            return Ok(());
        }
        let intent = ctx.intent_result()?.intent;
        let context_bucket = format!(
            "{}|{}",
            ctx.request.repo.as_deref().unwrap_or(""),
            ctx.budget / 1024
        );
        let signature =
            SignatureCache::signature_for(&ctx.request.query, intent, &context_bucket);

        if let Some(bundle) = ctx
            .pipeline
            .signature_cache()
            .lookup(ctx.pipeline.store(), &signature)
            .await
        {
            debug!("Signature cache hit; replaying stored bundle");
            ctx.bundle = Some(bundle);
            ctx.short_circuited = true;
        }
        ctx.signature = Some(signature);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateStage;

#[async_trait]
impl PipelineStage for GenerateStage {
    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited {
            return Ok(());
        }
        let intent = ctx.intent_result()?.clone();
        let policy = ctx.policy_decision()?.clone();

        let generators: Vec<Arc<dyn CandidateGenerator>> = ctx
            .pipeline
            .generators()
            .iter()
            .filter(|generator| match generator.source() {
                CandidateSource::Memory => {
                    ctx.request.include_memory && ctx.pipeline.config().features.memory
                }
                _ => true,
            })
            .map(Arc::clone)
            .collect();

        let generator_ctx = GeneratorContext {
            store: ctx.pipeline.store(),
            query: &ctx.request.query,
            intent: &intent,
            policy: &policy,
            filter: &ctx.filter,
            session_id: ctx.request.session_id.as_deref(),
            embedder: ctx.pipeline.embedder(),
            embedding_model: &ctx.pipeline.config().embedding_model,
        };

        let take = ctx.request.k.unwrap_or(ctx.pipeline.config().candidate_k);
        let (lists, reasons) = run_generators(
            &generators,
            &generator_ctx,
            take,
            ctx.pipeline.config().generator_timeout,
            &ctx.request.cancel,
        )
        .await;

        ctx.generated = lists;
        ctx.stopping_reasons.extend(reasons);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FuseStage;

#[async_trait]
impl PipelineStage for FuseStage {
    fn kind(&self) -> StageKind {
        StageKind::Fuse
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited {
            return Ok(());
        }
        let intent = ctx.intent_result()?.clone();
        let policy = ctx.policy_decision()?.clone();

        let outcome = ctx.pipeline.seed_mix().fuse(
            &ctx.generated,
            &policy,
            intent.intent,
            intent.confidence,
            ctx.pipeline.config().result_limit,
        );
        if outcome.early_stopped {
            ctx.stopping_reasons.push(StoppingReason::new(
                ReasonCategory::Quality,
                ReasonSeverity::Info,
                format!(
                    "early stop at {} candidates: score tail fell below the ratio floor",
                    policy.early_stop_threshold
                ),
            ));
        }
        ctx.early_stopped = outcome.early_stopped;
        ctx.fused = outcome.candidates;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpandStage;

#[async_trait]
impl PipelineStage for ExpandStage {
    fn kind(&self) -> StageKind {
        StageKind::Expand
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited || ctx.fused.is_empty() {
            return Ok(());
        }
        if !ctx.pipeline.config().features.graph {
            return Ok(());
        }
        let policy = ctx.policy_decision()?.clone();

        // Seeds: spans behind the strongest fused candidates.
        let mut seeds: Vec<SeedSpan> = Vec::new();
        for candidate in ctx.fused.iter().take(ctx.pipeline.config().graph_seed_limit) {
            let Some(chunk) = Chunk::by_id(&candidate.chunk_id, ctx.pipeline.store()).await?
            else {
                continue;
            };
            seeds.push(SeedSpan {
                span_id: chunk.span_id,
                score: candidate.score,
            });
        }
        if seeds.is_empty() {
            return Ok(());
        }

        let expansion_budget =
            (ctx.budget as f32 * ctx.pipeline.config().graph_budget_share) as usize;
        let permit = match ctx.pipeline.expansion_bulkhead().try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                ctx.stopping_reasons.push(
                    StoppingReason::new(
                        ReasonCategory::Resource,
                        ReasonSeverity::Warning,
                        format!("graph expansion skipped: {err}"),
                    )
                    .with_hint("raise limits.max_concurrent_expansions"),
                );
                return Ok(());
            }
        };

        let expansion = ctx
            .pipeline
            .expander()
            .expand(
                ctx.pipeline.store(),
                ctx.pipeline.tokenizers(),
                &ctx.model,
                &seeds,
                policy.max_depth,
                expansion_budget,
                &EdgeKind::ALL,
                &ctx.request.cancel,
            )
            .await;
        drop(permit);

        match expansion {
            Ok(expansion) => {
                if expansion.truncated {
                    ctx.stopping_reasons.push(StoppingReason::new(
                        ReasonCategory::Resource,
                        ReasonSeverity::Info,
                        format!(
                            "graph expansion truncated by token guard ({} of {} tokens)",
                            expansion.tokens_used, expansion_budget
                        ),
                    ));
                }
                ctx.expansion = Some(expansion);
            }
            Err(PampaxError::Cancelled(op)) => return Err(PampaxError::Cancelled(op)),
            Err(err) => {
                warn!(error = %err, "Graph expansion failed; continuing without it");
                ctx.stopping_reasons.push(StoppingReason::new(
                    ReasonCategory::Error,
                    ReasonSeverity::Warning,
                    format!("graph expansion failed: {err}"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HydrateStage;

#[async_trait]
impl PipelineStage for HydrateStage {
    fn kind(&self) -> StageKind {
        StageKind::Hydrate
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited {
            return Ok(());
        }
        let policy = ctx.policy_decision()?.clone();

        // Merge graph nodes into the fused list with graph provenance.
        if let Some(expansion) = &ctx.expansion {
            let graph_weight = policy.weight("graph");
            for node in &expansion.nodes {
                let Some(chunk_id) = &node.chunk_id else {
                    continue;
                };
                if let Some(existing) = ctx.fused.iter_mut().find(|c| &c.chunk_id == chunk_id) {
                    if !existing.sources.contains(&CandidateSource::Graph) {
                        existing.sources.push(CandidateSource::Graph);
                        existing
                            .reasons
                            .push(format!("graph {} edge from {}", node.via, node.from_span_id));
                    }
                    continue;
                }
                ctx.fused.push(FusedCandidate {
                    chunk_id: chunk_id.clone(),
                    score: graph_weight * node.confidence
                        / (crate::fusion::RRF_K + f32::from(node.depth) * 10.0),
                    sources: vec![CandidateSource::Graph],
                    max_source_score: node.confidence,
                    reasons: vec![format!(
                        "graph {} edge from {} at depth {}",
                        node.via, node.from_span_id, node.depth
                    )],
                });
            }
        }

        let mut candidates: Vec<PackCandidate> = Vec::with_capacity(ctx.fused.len());
        for fused in &ctx.fused {
            if ctx.request.cancel.is_cancelled() {
                return Err(PampaxError::Cancelled("hydration".to_string()));
            }

            let memory_only = fused.sources.iter().all(|s| *s == CandidateSource::Memory);
            if memory_only {
                let Some(item) = MemoryItem::by_id(&fused.chunk_id, ctx.pipeline.store()).await?
                else {
                    continue;
                };
                candidates.push(PackCandidate {
                    chunk_id: fused.chunk_id.clone(),
                    content: item.content,
                    span: None,
                    sources: fused.sources.iter().map(|s| s.to_string()).collect(),
                    score: fused.score,
                    reasons: fused.reasons.clone(),
                });
                continue;
            }

            let Some(chunk) = Chunk::by_id(&fused.chunk_id, ctx.pipeline.store()).await? else {
                // Stale cache reference; degrade silently.
                continue;
            };
            let span = Span::by_id(&chunk.span_id, ctx.pipeline.store()).await?;
            candidates.push(PackCandidate {
                chunk_id: fused.chunk_id.clone(),
                content: chunk.content,
                span,
                sources: fused.sources.iter().map(|s| s.to_string()).collect(),
                score: fused.score,
                reasons: fused.reasons.clone(),
            });
        }

        ctx.pack_candidates = candidates;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PackStage;

#[async_trait]
impl PipelineStage for PackStage {
    fn kind(&self) -> StageKind {
        StageKind::Pack
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited {
            return Ok(());
        }
        let intent = ctx.intent_result()?.clone();
        let policy = ctx.policy_decision()?.clone();

        let repo_key = ctx.request.repo.clone().unwrap_or_else(|| "*".to_string());
        let profile =
            PackingProfile::get_or_default(&repo_key, &ctx.model, ctx.pipeline.store()).await?;

        let outcome = ctx.pipeline.packer().pack(
            std::mem::take(&mut ctx.pack_candidates),
            &ctx.model,
            intent.intent,
            &policy,
            &profile,
            ctx.budget,
            ctx.pipeline.tokenizers(),
        );

        let mut stopping_reasons = std::mem::take(&mut ctx.stopping_reasons);
        stopping_reasons.extend(outcome.stopping_reasons);

        ctx.bundle = Some(Bundle {
            query: ctx.request.query.clone(),
            intent: intent.intent,
            items: outcome.items,
            token_report: outcome.token_report,
            degradation_level: outcome.degradation_level,
            stopping_reasons,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        if ctx.short_circuited {
            return Ok(());
        }
        if !ctx.pipeline.config().features.rerank {
            return Ok(());
        }
        let Some(bus) = ctx.pipeline.reranker_bus() else {
            return Ok(());
        };
        let Some(mut bundle) = ctx.bundle.take() else {
            return Ok(());
        };
        if bundle.items.len() <= 1 {
            ctx.bundle = Some(bundle);
            return Ok(());
        }

        let documents: Vec<RerankDocument> = bundle
            .items
            .iter()
            .take(ctx.pipeline.config().rerank_top_n)
            .map(|item| RerankDocument {
                doc_ref: item.chunk_id.clone(),
                text: item.chunk_content.clone(),
            })
            .collect();

        match bus
            .rerank(
                ctx.pipeline.store(),
                &ctx.request.query,
                documents,
                ctx.request.rerank_provider.as_deref(),
            )
            .await
        {
            Ok(outcome) => {
                let mut reordered: Vec<_> = Vec::with_capacity(bundle.items.len());
                for ranked in &outcome.ranking {
                    if let Some(position) = bundle
                        .items
                        .iter()
                        .position(|item| item.chunk_id == ranked.doc_ref)
                    {
                        let mut item = bundle.items.remove(position);
                        item.score = ranked.score;
                        reordered.push(item);
                    }
                }
                reordered.append(&mut bundle.items);
                for (rank, item) in reordered.iter_mut().enumerate() {
                    item.rank = rank;
                }
                bundle.items = reordered;
                debug!(provider = %outcome.provider, cache_hit = outcome.cache_hit, "Bundle reranked");
            }
            Err(PampaxError::InvalidInput(message)) => {
                return Err(PampaxError::InvalidInput(message));
            }
            Err(err) => {
                warn!(error = %err, "Rerank failed; keeping packed order");
                bundle.stopping_reasons.push(
                    StoppingReason::new(
                        ReasonCategory::Error,
                        ReasonSeverity::Warning,
                        format!("rerank unavailable: {err}"),
                    )
                    .with_hint("check rerank provider configuration"),
                );
            }
        }
        ctx.bundle = Some(bundle);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordStage;

#[async_trait]
impl PipelineStage for RecordStage {
    fn kind(&self) -> StageKind {
        StageKind::Record
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), PampaxError> {
        let (intent, bundle_signature, token_usage, item_count) = match ctx.bundle.as_ref() {
            Some(bundle) => (
                bundle.intent,
                bundle.signature(),
                bundle.token_report.actual as u64,
                bundle.items.len(),
            ),
            None => return Ok(()),
        };
        let duration_ms = ctx.started.elapsed().as_millis() as u64;

        // Operational log writes are recoverable by contract.
        if let Err(err) = SearchLog::append(
            &ctx.request.query,
            intent.as_str(),
            duration_ms,
            item_count,
            ctx.pipeline.store(),
        )
        .await
        {
            warn!(error = %err, "search_log write failed");
        }

        let Some(session_id) = ctx.request.session_id.clone() else {
            return Ok(());
        };
        let Some(policy) = ctx.policy.as_ref() else {
            return Ok(());
        };

        let mut interaction = Interaction::new(
            &session_id,
            &ctx.request.query,
            intent.as_str(),
            &bundle_signature,
            token_usage,
            policy.seed_weights.clone(),
            PolicyThresholds {
                max_depth: policy.max_depth,
                early_stop_threshold: policy.early_stop_threshold,
            },
        );
        interaction.language = ctx.request.language.clone();
        interaction.repo = ctx.request.repo.clone();

        let recorded = match Session::ensure(&session_id, ctx.pipeline.store()).await {
            Ok(()) => interaction.record(ctx.pipeline.store()).await,
            Err(err) => Err(err),
        };
        match recorded {
            Ok(()) => ctx.interaction_id = Some(interaction.id),
            Err(err) => {
                warn!(error = %err, "Interaction record failed");
                ctx.stopping_reasons.push(StoppingReason::new(
                    ReasonCategory::Error,
                    ReasonSeverity::Info,
                    format!("interaction not recorded: {err}"),
                ));
            }
        }
        Ok(())
    }
}
