mod config;
pub mod stages;

pub use config::PipelineConfig;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use common::{
    error::PampaxError,
    reliability::{with_timeout, Bulkhead, DegradationManager, OperationClass},
    storage::{db::SqliteStore, SearchFilter},
    tokenizer::TokenizerFactory,
    utils::{config::TokenizerConfig, embedding::EmbeddingProvider},
};

use crate::{
    fusion::{FusedCandidate, SeedMixOptimizer},
    generators::{
        fts::FtsGenerator, memory::MemoryGenerator, symbol::SymbolGenerator,
        vector::VectorGenerator, CandidateGenerator, CandidateRef, CandidateSource,
    },
    graph::{GraphExpander, GraphExpansion},
    intent::{Intent, IntentClassifier, IntentResult},
    packing::{PackCandidate, PackingEngine},
    policy::{PolicyDecision, PolicyGate},
    reranking::RerankerBus,
    signature::SignatureCache,
    Bundle, SpanRef, StoppingReason,
};

use stages::{
    BoxedStage, ClassifyStage, ExpandStage, FuseStage, GateStage, GenerateStage, HydrateStage,
    PackStage, PipelineStage, RecordStage, RerankStage, SignatureLookupStage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Classify,
    Gate,
    SignatureLookup,
    Generate,
    Fuse,
    Expand,
    Hydrate,
    Pack,
    Rerank,
    Record,
}

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }
}

/// One retrieval request. `cancel` is honored at every stage boundary and
/// at suspension points inside the stages.
#[derive(Debug, Clone)]
pub struct AssembleRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub repo: Option<String>,
    pub language: Option<String>,
    pub path_glob: Option<String>,
    pub intent_override: Option<Intent>,
    pub target_model: Option<String>,
    pub token_budget: Option<usize>,
    pub rerank_provider: Option<String>,
    pub include_memory: bool,
    /// Per-source candidate take; the configured default when unset.
    pub k: Option<usize>,
    pub cancel: CancellationToken,
}

impl AssembleRequest {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_owned(),
            session_id: None,
            repo: None,
            language: None,
            path_glob: None,
            intent_override: None,
            target_model: None,
            token_budget: None,
            rerank_provider: None,
            include_memory: true,
            k: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Search shares the assemble option surface.
pub type SearchRequest = AssembleRequest;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchItem {
    pub chunk_id: String,
    pub span_ref: Option<SpanRef>,
    pub score: f32,
    pub sources: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub query: String,
    pub intent: Intent,
    pub confidence: f32,
    pub items: Vec<SearchItem>,
    pub stopping_reasons: Vec<StoppingReason>,
}

/// Mutable state threaded through the stages of one request.
pub struct PipelineContext<'a> {
    pub(crate) pipeline: &'a RetrievalPipeline,
    pub request: AssembleRequest,
    pub filter: SearchFilter,
    pub model: String,
    pub budget: usize,
    pub intent: Option<IntentResult>,
    pub policy: Option<PolicyDecision>,
    pub signature: Option<String>,
    pub short_circuited: bool,
    pub generated: Vec<(CandidateSource, Vec<CandidateRef>)>,
    pub fused: Vec<FusedCandidate>,
    pub early_stopped: bool,
    pub expansion: Option<GraphExpansion>,
    pub pack_candidates: Vec<PackCandidate>,
    pub bundle: Option<Bundle>,
    pub stopping_reasons: Vec<StoppingReason>,
    pub interaction_id: Option<String>,
    pub(crate) stage_timings: PipelineStageTimings,
    pub(crate) started: Instant,
}

impl PipelineContext<'_> {
    pub fn intent_result(&self) -> Result<&IntentResult, PampaxError> {
        self.intent
            .as_ref()
            .ok_or_else(|| PampaxError::Internal("intent missing before this stage".to_string()))
    }

    pub fn policy_decision(&self) -> Result<&PolicyDecision, PampaxError> {
        self.policy
            .as_ref()
            .ok_or_else(|| PampaxError::Internal("policy missing before this stage".to_string()))
    }
}

pub trait StrategyDriver {
    type Output;

    fn stages(&self) -> Vec<BoxedStage>;
    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, PampaxError>;
}

pub struct AssembleDriver;

impl StrategyDriver for AssembleDriver {
    type Output = Bundle;

    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(ClassifyStage),
            Box::new(GateStage),
            Box::new(SignatureLookupStage),
            Box::new(GenerateStage),
            Box::new(FuseStage),
            Box::new(ExpandStage),
            Box::new(HydrateStage),
            Box::new(PackStage),
            Box::new(RerankStage),
            Box::new(RecordStage),
        ]
    }

    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, PampaxError> {
        let mut bundle = ctx
            .bundle
            .take()
            .ok_or_else(|| PampaxError::Internal("pipeline produced no bundle".to_string()))?;
        bundle
            .stopping_reasons
            .append(&mut ctx.stopping_reasons);
        for reason in &bundle.stopping_reasons {
            ctx.pipeline.notify_stopping(reason);
        }
        Ok(bundle)
    }
}

pub struct SearchDriver;

impl StrategyDriver for SearchDriver {
    type Output = SearchResult;

    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(ClassifyStage),
            Box::new(GateStage),
            Box::new(GenerateStage),
            Box::new(FuseStage),
            Box::new(HydrateStage),
        ]
    }

    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, PampaxError> {
        let intent = ctx.intent_result()?.clone();
        let mut candidates = std::mem::take(&mut ctx.pack_candidates);
        if let Some(k) = ctx.request.k {
            candidates.truncate(k);
        }
        let items = candidates
            .into_iter()
            .map(|candidate| {
                let snippet: String = candidate.content.chars().take(240).collect();
                SearchItem {
                    chunk_id: candidate.chunk_id,
                    span_ref: candidate.span.as_ref().map(SpanRef::from_span),
                    score: candidate.score,
                    sources: candidate.sources.join("+"),
                    snippet,
                }
            })
            .collect();

        let result = SearchResult {
            query: ctx.request.query.clone(),
            intent: intent.intent,
            confidence: intent.confidence,
            items,
            stopping_reasons: std::mem::take(&mut ctx.stopping_reasons),
        };
        for reason in &result.stopping_reasons {
            ctx.pipeline.notify_stopping(reason);
        }
        Ok(result)
    }
}

type StoppingObserver = Box<dyn Fn(&StoppingReason) + Send + Sync>;

/// The retrieval core. Owns every cache and component explicitly; callers
/// construct one per store and share it.
pub struct RetrievalPipeline {
    store: Arc<SqliteStore>,
    tokenizers: Arc<TokenizerFactory>,
    classifier: IntentClassifier,
    gate: PolicyGate,
    seed_mix: SeedMixOptimizer,
    expander: GraphExpander,
    packer: PackingEngine,
    bus: Option<Arc<RerankerBus>>,
    signature_cache: SignatureCache,
    embedder: Option<Arc<EmbeddingProvider>>,
    generators: Vec<Arc<dyn CandidateGenerator>>,
    expansion_bulkhead: Bulkhead,
    degradation: DegradationManager,
    config: PipelineConfig,
    observers: Vec<StoppingObserver>,
}

impl RetrievalPipeline {
    pub fn new(store: Arc<SqliteStore>, config: PipelineConfig) -> Self {
        let generators: Vec<Arc<dyn CandidateGenerator>> = vec![
            Arc::new(FtsGenerator),
            Arc::new(VectorGenerator),
            Arc::new(MemoryGenerator),
            Arc::new(SymbolGenerator),
        ];
        Self {
            store,
            tokenizers: Arc::new(TokenizerFactory::new(TokenizerConfig::default(), 4096)),
            classifier: IntentClassifier::new(),
            gate: PolicyGate::new(),
            seed_mix: SeedMixOptimizer::new(config.seed_profile_max, config.seed_profile_ttl),
            expander: GraphExpander::new(
                config.graph_cache_max,
                config.graph_cache_ttl,
                config.graph_fanout,
            ),
            packer: PackingEngine,
            bus: None,
            signature_cache: SignatureCache::new(
                config.signature_max_size,
                config.signature_ttl_days,
            ),
            embedder: None,
            generators,
            expansion_bulkhead: Bulkhead::new("graph-expansion", config.max_concurrent_expansions),
            degradation: DegradationManager::new(),
            config,
            observers: Vec::new(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reranker_bus(mut self, bus: Arc<RerankerBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_gate(mut self, gate: PolicyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_tokenizers(mut self, tokenizers: Arc<TokenizerFactory>) -> Self {
        self.tokenizers = tokenizers;
        self
    }

    /// Register a stopping-reason observer for the rendering collaborator.
    pub fn on_stopping_reason(
        &mut self,
        observer: impl Fn(&StoppingReason) + Send + Sync + 'static,
    ) {
        self.observers.push(Box::new(observer));
    }

    pub(crate) fn notify_stopping(&self, reason: &StoppingReason) {
        for observer in &self.observers {
            observer(reason);
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tokenizers(&self) -> &TokenizerFactory {
        &self.tokenizers
    }

    pub(crate) fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    pub(crate) fn gate(&self) -> &PolicyGate {
        &self.gate
    }

    pub(crate) fn seed_mix(&self) -> &SeedMixOptimizer {
        &self.seed_mix
    }

    pub(crate) fn expander(&self) -> &GraphExpander {
        &self.expander
    }

    pub(crate) fn packer(&self) -> &PackingEngine {
        &self.packer
    }

    pub fn reranker_bus(&self) -> Option<&Arc<RerankerBus>> {
        self.bus.as_ref()
    }

    pub fn signature_cache(&self) -> &SignatureCache {
        &self.signature_cache
    }

    pub(crate) fn embedder(&self) -> Option<&EmbeddingProvider> {
        self.embedder.as_deref()
    }

    pub(crate) fn generators(&self) -> &[Arc<dyn CandidateGenerator>] {
        &self.generators
    }

    pub(crate) fn expansion_bulkhead(&self) -> &Bulkhead {
        &self.expansion_bulkhead
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.degradation
    }

    fn context_for(&self, request: AssembleRequest) -> PipelineContext<'_> {
        let filter = SearchFilter {
            repo: request.repo.clone(),
            path_glob: request.path_glob.clone(),
            language: request.language.clone(),
        };
        let model = request
            .target_model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let budget = request
            .token_budget
            .unwrap_or(self.config.default_token_budget);
        PipelineContext {
            pipeline: self,
            request,
            filter,
            model,
            budget,
            intent: None,
            policy: None,
            signature: None,
            short_circuited: false,
            generated: Vec::new(),
            fused: Vec::new(),
            early_stopped: false,
            expansion: None,
            pack_candidates: Vec::new(),
            bundle: None,
            stopping_reasons: Vec::new(),
            interaction_id: None,
            stage_timings: PipelineStageTimings::default(),
            started: Instant::now(),
        }
    }

    async fn run_with_driver<D: StrategyDriver>(
        &self,
        driver: D,
        mut ctx: PipelineContext<'_>,
    ) -> Result<D::Output, PampaxError> {
        for stage in driver.stages() {
            if ctx.request.cancel.is_cancelled() {
                return Err(PampaxError::Cancelled("retrieval pipeline".to_string()));
            }
            let start = Instant::now();
            stage.execute(&mut ctx).await?;
            ctx.stage_timings.record(stage.kind(), start.elapsed());
        }
        driver.finalize(&mut ctx)
    }

    /// Full assemble path: intent → policy → candidates → fusion → graph →
    /// packing → rerank → interaction record.
    #[instrument(skip_all, fields(query_chars = request.query.chars().count()))]
    pub async fn assemble(&self, request: AssembleRequest) -> Result<Bundle, PampaxError> {
        info!(
            session = request.session_id.as_deref().unwrap_or("-"),
            "Starting assemble"
        );
        let ctx = self.context_for(request);
        with_timeout(
            OperationClass::Assembly,
            Some(self.config.assembly_timeout),
            self.run_with_driver(AssembleDriver, ctx),
        )
        .await
    }

    /// Lighter ranked-results path: no graph expansion, no packing.
    #[instrument(skip_all, fields(query_chars = request.query.chars().count()))]
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResult, PampaxError> {
        let ctx = self.context_for(request);
        with_timeout(
            OperationClass::Search,
            Some(self.config.search_timeout),
            self.run_with_driver(SearchDriver, ctx),
        )
        .await
    }

    /// Attach an observed outcome to a recorded interaction, feeding the
    /// signature cache when satisfaction clears the write floor.
    pub async fn record_outcome(
        &self,
        interaction_id: &str,
        top_click: Option<&str>,
        satisfied: Option<bool>,
        time_to_fix_ms: Option<u64>,
    ) -> Result<(), PampaxError> {
        common::storage::types::interaction::Interaction::mark_outcome(
            interaction_id,
            top_click,
            satisfied,
            time_to_fix_ms,
            &self.store,
        )
        .await?;
        Ok(())
    }

    /// Store a bundle for signature replay. A no-op below the
    /// satisfaction write floor.
    pub async fn cache_high_satisfaction(
        &self,
        repo: Option<&str>,
        bundle: &Bundle,
        satisfaction: f32,
    ) -> Result<(), PampaxError> {
        let context_bucket = format!(
            "{}|{}",
            repo.unwrap_or(""),
            bundle.token_report.budget / 1024
        );
        let signature =
            SignatureCache::signature_for(&bundle.query, bundle.intent, &context_bucket);
        self.signature_cache
            .record(&self.store, &signature, bundle, satisfaction)
            .await
    }
}
