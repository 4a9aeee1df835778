use std::{path::Path, sync::Arc, time::Duration};

use clap::{Args, Subcommand};
use serde_json::{json, Value};

use common::{
    error::PampaxError,
    storage::{db::SqliteStore, types::memory_item::MemoryFilter},
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use learning::LearnOptions;
use retrieval_pipeline::{
    intent::Intent,
    ops,
    pipeline::{AssembleRequest, PipelineConfig, RetrievalPipeline},
    reranking::RerankerBus,
};

#[derive(Args)]
pub struct QueryOpts {
    pub query: String,
    #[arg(long)]
    pub k: Option<usize>,
    #[arg(long)]
    pub repo: Option<String>,
    #[arg(long)]
    pub language: Option<String>,
    #[arg(long)]
    pub path_glob: Option<String>,
    /// Force an intent instead of classifying.
    #[arg(long)]
    pub intent: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub budget: Option<usize>,
    #[arg(long)]
    pub rerank_provider: Option<String>,
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Args)]
pub struct SearchArgs {
    #[command(flatten)]
    pub opts: QueryOpts,
}

#[derive(Args)]
pub struct AssembleArgs {
    #[command(flatten)]
    pub opts: QueryOpts,
    /// Leave session memories out of the bundle.
    #[arg(long)]
    pub no_memory: bool,
}

#[derive(Args)]
pub struct RerankArgs {
    pub query: String,
    /// JSON file holding one or more candidate lists
    /// (`[[{"doc_ref": "...", "text": "..."}, ...], ...]`).
    #[arg(long)]
    pub input: String,
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub top_k: Option<usize>,
}

#[derive(Args)]
pub struct RememberArgs {
    #[arg(long)]
    pub session: String,
    #[arg(long, default_value = "note")]
    pub kind: String,
    pub content: String,
    #[arg(long)]
    pub key: Option<String>,
    #[arg(long)]
    pub pinned: bool,
}

#[derive(Args)]
pub struct RecallArgs {
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long)]
    pub kind: Option<String>,
    #[arg(long)]
    pub pinned_only: bool,
}

#[derive(Args)]
pub struct ForgetArgs {
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long)]
    pub kind: Option<String>,
}

#[derive(Args)]
pub struct PinArgs {
    #[arg(long)]
    pub session: String,
    pub span_id: String,
    #[arg(long)]
    pub label: Option<String>,
    #[arg(long)]
    pub note: Option<String>,
}

#[derive(Args)]
pub struct LearnArgs {
    #[arg(long, default_value_t = 30)]
    pub from_days: i64,
    #[arg(long)]
    pub update_weights: bool,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    Show,
    Validate,
    Export,
}

fn build_pipeline(config: &AppConfig) -> Result<RetrievalPipeline, PampaxError> {
    let store = Arc::new(SqliteStore::open(Path::new(&config.storage_path))?);
    let mut pipeline = RetrievalPipeline::new(store, PipelineConfig::from_app(config));

    if let Some(embedder) = EmbeddingProvider::from_config(config)? {
        pipeline = pipeline.with_embedder(Arc::new(embedder));
    }
    if config.features.rerank {
        let bus = RerankerBus::from_config(
            &config.rerank,
            config.limits.max_concurrent_external,
            Duration::from_millis(config.timeouts.rerank_ms),
            config.cache.rerank_ttl_hours,
        )?;
        pipeline = pipeline.with_reranker_bus(Arc::new(bus));
    }
    Ok(pipeline)
}

fn request_from(opts: QueryOpts, include_memory: bool) -> Result<AssembleRequest, PampaxError> {
    let mut request = AssembleRequest::new(&opts.query);
    request.k = opts.k;
    request.repo = opts.repo;
    request.language = opts.language;
    request.path_glob = opts.path_glob;
    request.target_model = opts.model;
    request.token_budget = opts.budget;
    request.rerank_provider = opts.rerank_provider;
    request.session_id = opts.session;
    request.include_memory = include_memory;
    if let Some(intent) = opts.intent {
        let parsed: Intent = intent
            .parse()
            .map_err(PampaxError::InvalidInput)?;
        request.intent_override = Some(parsed);
    }
    Ok(request)
}

pub async fn run(command: super::Command, config: AppConfig) -> Result<Value, PampaxError> {
    match command {
        super::Command::Init => {
            let _store = SqliteStore::open(Path::new(&config.storage_path))?;
            Ok(json!({
                "success": true,
                "storage_path": config.storage_path,
            }))
        }
        super::Command::Search(args) => {
            let pipeline = build_pipeline(&config)?;
            let request = request_from(args.opts, true)?;
            ops::search(&pipeline, request).await
        }
        super::Command::Assemble(args) => {
            let pipeline = build_pipeline(&config)?;
            let include_memory = !args.no_memory;
            let request = request_from(args.opts, include_memory)?;
            ops::assemble(&pipeline, request).await
        }
        super::Command::Rerank(args) => {
            let pipeline = build_pipeline(&config)?;
            let raw = std::fs::read_to_string(&args.input)?;
            let inputs: Vec<Vec<ops::RerankInput>> = serde_json::from_str(&raw)?;
            ops::rerank(
                &pipeline,
                &args.query,
                inputs,
                args.provider.as_deref(),
                args.top_k,
            )
            .await
        }
        super::Command::Remember(args) => {
            let pipeline = build_pipeline(&config)?;
            ops::remember_create(
                &pipeline,
                &args.session,
                &args.kind,
                &args.content,
                args.key.as_deref(),
                args.pinned,
                None,
            )
            .await
        }
        super::Command::Recall(args) => {
            let pipeline = build_pipeline(&config)?;
            ops::remember_query(
                &pipeline,
                MemoryFilter {
                    session_id: args.session,
                    kind: args.kind,
                    pinned_only: args.pinned_only,
                    ..MemoryFilter::default()
                },
            )
            .await
        }
        super::Command::Forget(args) => {
            let pipeline = build_pipeline(&config)?;
            let filter = if args.session.is_some() || args.kind.is_some() {
                Some(MemoryFilter {
                    session_id: args.session,
                    kind: args.kind,
                    ..MemoryFilter::default()
                })
            } else {
                None
            };
            ops::forget(&pipeline, args.id.as_deref(), filter).await
        }
        super::Command::Pin(args) => {
            let pipeline = build_pipeline(&config)?;
            ops::pin_span(
                &pipeline,
                &args.session,
                &args.span_id,
                args.label.as_deref(),
                args.note.as_deref(),
            )
            .await
        }
        super::Command::Learn(args) => {
            let store = SqliteStore::open(Path::new(&config.storage_path))?;
            let report = learning::run(
                &store,
                &config.learning,
                LearnOptions {
                    from_days: args.from_days,
                    update_weights: args.update_weights,
                    dry_run: args.dry_run,
                },
            )
            .await?;
            Ok(serde_json::to_value(&report)?)
        }
        super::Command::Config(args) => Ok(match args.action {
            ConfigAction::Show => ops::config_show(&config),
            ConfigAction::Validate => ops::config_validate(&config),
            ConfigAction::Export => ops::config_export(&config),
        }),
        super::Command::Health => {
            let pipeline = build_pipeline(&config)?;
            ops::health(&pipeline).await
        }
    }
}
