//! §-style operations facade: every public operation returns an
//! ordered-key JSON envelope (`success`, primary fields, then `meta`) or a
//! typed error the CLI maps to an exit code.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use common::{
    error::PampaxError,
    storage::types::{
        chunk::Chunk,
        memory_item::{MemoryFilter, MemoryItem},
        memory_link::MemoryLink,
        session::Session,
        span::Span,
    },
    utils::config::AppConfig,
};

use crate::{
    pipeline::{AssembleRequest, RetrievalPipeline, SearchRequest},
    reranking::{rrf::fuse_rankings, RankedDocument, RerankDocument},
};

fn envelope(command: &str, started: Instant, primary: Vec<(&str, Value)>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("success".to_string(), json!(true));
    for (key, value) in primary {
        map.insert(key.to_string(), value);
    }
    map.insert(
        "meta".to_string(),
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "command": command,
            "duration_ms": started.elapsed().as_millis() as u64,
            "mode": "core",
        }),
    );
    Value::Object(map)
}

/// Error payload mirrored by every surface: kind, stable code, message,
/// and a correlation id for log stitching.
pub fn error_envelope(command: &str, err: &PampaxError) -> Value {
    let kind = err.kind();
    json!({
        "success": false,
        "error": {
            "kind": kind.as_str(),
            "code": kind.code(),
            "message": err.to_string(),
            "correlation_id": Uuid::new_v4().to_string(),
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "command": command,
            "mode": "core",
        },
    })
}

pub async fn search(
    pipeline: &RetrievalPipeline,
    request: SearchRequest,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    let query = request.query.clone();
    let result = pipeline.search(request).await?;
    Ok(envelope(
        "search",
        started,
        vec![
            ("query", json!(query)),
            ("intent", json!(result.intent.as_str())),
            ("confidence", json!(result.confidence)),
            ("results", serde_json::to_value(&result.items)?),
            (
                "stopping_reasons",
                serde_json::to_value(&result.stopping_reasons)?,
            ),
        ],
    ))
}

pub async fn assemble(
    pipeline: &RetrievalPipeline,
    request: AssembleRequest,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    let query = request.query.clone();
    let bundle = pipeline.assemble(request).await?;
    Ok(envelope(
        "assemble",
        started,
        vec![
            ("query", json!(query)),
            ("intent", json!(bundle.intent.as_str())),
            ("items", serde_json::to_value(&bundle.items)?),
            ("token_report", serde_json::to_value(&bundle.token_report)?),
            ("degradation_level", json!(bundle.degradation_level)),
            (
                "stopping_reasons",
                serde_json::to_value(&bundle.stopping_reasons)?,
            ),
            ("bundle_id", json!(bundle.bundle_id())),
        ],
    ))
}

/// Candidate list supplied to the standalone rerank operation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RerankInput {
    pub doc_ref: String,
    pub text: String,
}

/// Standalone rerank. A single list goes through the provider bus; the
/// `rrf_fusion` provider with several lists fuses them without any
/// external call.
pub async fn rerank(
    pipeline: &RetrievalPipeline,
    query: &str,
    inputs: Vec<Vec<RerankInput>>,
    provider: Option<&str>,
    top_k: Option<usize>,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    if inputs.is_empty() || inputs.iter().all(|list| list.is_empty()) {
        return Err(PampaxError::InvalidInput(
            "rerank requires at least one non-empty candidate list".to_string(),
        ));
    }

    let mut ranking: Vec<RankedDocument> = if inputs.len() > 1 {
        if !matches!(provider, None | Some("rrf_fusion")) {
            return Err(PampaxError::InvalidInput(
                "multiple candidate lists are only fused with rrf_fusion".to_string(),
            ));
        }
        let lists: Vec<Vec<RankedDocument>> = inputs
            .into_iter()
            .map(|list| {
                list.into_iter()
                    .enumerate()
                    .map(|(position, input)| RankedDocument {
                        doc_ref: input.doc_ref,
                        score: 1.0 / (position + 1) as f32,
                    })
                    .collect()
            })
            .collect();
        fuse_rankings(&lists)
    } else {
        let bus = pipeline
            .reranker_bus()
            .ok_or_else(|| PampaxError::Unavailable("no reranker bus configured".to_string()))?;
        let documents: Vec<RerankDocument> = inputs
            .into_iter()
            .flatten()
            .map(|input| RerankDocument {
                doc_ref: input.doc_ref,
                text: input.text,
            })
            .collect();
        bus.rerank(pipeline.store(), query, documents, provider)
            .await?
            .ranking
    };

    if let Some(top_k) = top_k {
        ranking.truncate(top_k);
    }

    Ok(envelope(
        "rerank",
        started,
        vec![
            ("query", json!(query)),
            ("results", serde_json::to_value(&ranking)?),
        ],
    ))
}

pub async fn remember_create(
    pipeline: &RetrievalPipeline,
    session_id: &str,
    kind: &str,
    content: &str,
    key: Option<&str>,
    pinned: bool,
    metadata: Option<Value>,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    if content.trim().is_empty() {
        return Err(PampaxError::InvalidInput(
            "memory content must not be empty".to_string(),
        ));
    }

    Session::ensure(session_id, pipeline.store()).await?;
    let mut item = MemoryItem::new(session_id, kind, content);
    if let Some(key) = key {
        item = item.with_key(key);
    }
    if let Some(metadata) = metadata {
        item = item.with_metadata(metadata);
    }
    if pinned {
        item = item.pinned();
    }
    item.upsert(pipeline.store()).await?;

    Ok(envelope(
        "remember",
        started,
        vec![("memory", serde_json::to_value(&item)?)],
    ))
}

pub async fn remember_query(
    pipeline: &RetrievalPipeline,
    filter: MemoryFilter,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    let items = MemoryItem::query(filter, pipeline.store()).await?;
    Ok(envelope(
        "remember-query",
        started,
        vec![("results", serde_json::to_value(&items)?)],
    ))
}

pub async fn forget(
    pipeline: &RetrievalPipeline,
    id: Option<&str>,
    filter: Option<MemoryFilter>,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    let removed = match (id, filter) {
        (Some(id), _) => usize::from(MemoryItem::delete(id, pipeline.store()).await?),
        (None, Some(filter)) => MemoryItem::forget(filter, pipeline.store()).await?,
        (None, None) => {
            return Err(PampaxError::InvalidInput(
                "forget requires an id or a filter".to_string(),
            ))
        }
    };
    Ok(envelope("forget", started, vec![("removed", json!(removed))]))
}

pub async fn pin_span(
    pipeline: &RetrievalPipeline,
    session_id: &str,
    span_id: &str,
    label: Option<&str>,
    note: Option<&str>,
) -> Result<Value, PampaxError> {
    let started = Instant::now();
    let span = Span::by_id(span_id, pipeline.store())
        .await?
        .ok_or_else(|| PampaxError::NotFound(format!("span {span_id}")))?;

    Session::ensure(session_id, pipeline.store()).await?;
    let content = format!(
        "pinned span {} ({})",
        span.name.as_deref().unwrap_or(&span.span_id),
        span.path
    );
    let item = MemoryItem::new(session_id, "pin", &content).pinned();
    item.upsert(pipeline.store()).await?;
    MemoryLink::new(&item.id, span_id, label, note)
        .insert(pipeline.store())
        .await?;

    Ok(envelope(
        "pin-span",
        started,
        vec![
            ("memory_id", json!(item.id)),
            ("span_id", json!(span_id)),
        ],
    ))
}

pub async fn health(pipeline: &RetrievalPipeline) -> Result<Value, PampaxError> {
    let started = Instant::now();

    let store_ok = Chunk::fts_integrity(pipeline.store()).await.is_ok();
    let fts_consistent = Chunk::fts_integrity(pipeline.store()).await.unwrap_or(false);
    pipeline
        .degradation()
        .report_health("store", if store_ok && fts_consistent { 1.0 } else { 0.0 });

    let providers: Vec<Value> = pipeline
        .reranker_bus()
        .map(|bus| {
            crate::reranking::KNOWN_PROVIDER_IDS
                .iter()
                .filter_map(|id| bus.provider(id).ok().map(|provider| (*id, provider)))
                .map(|(id, provider)| {
                    json!({
                        "id": id,
                        "available": provider.is_available(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let signature_stats = pipeline.signature_cache().stats();
    Ok(envelope(
        "health",
        started,
        vec![
            ("store_ok", json!(store_ok)),
            ("fts_consistent", json!(fts_consistent)),
            ("service_level", serde_json::to_value(pipeline.degradation().level())?),
            ("health_score", json!(pipeline.degradation().health_score())),
            ("rerank_providers", Value::Array(providers)),
            ("signature_cache", serde_json::to_value(&signature_stats)?),
            (
                "signature_hit_rate",
                json!(pipeline.signature_cache().hit_rate()),
            ),
        ],
    ))
}

pub fn config_show(config: &AppConfig) -> Value {
    let started = Instant::now();
    envelope(
        "config-show",
        started,
        vec![("config", config.to_redacted_json())],
    )
}

pub fn config_validate(config: &AppConfig) -> Value {
    let started = Instant::now();
    match config.validate() {
        Ok(()) => envelope("config-validate", started, vec![("valid", json!(true))]),
        Err(message) => envelope(
            "config-validate",
            started,
            vec![("valid", json!(false)), ("problem", json!(message))],
        ),
    }
}

pub fn config_export(config: &AppConfig) -> Value {
    let started = Instant::now();
    envelope(
        "config-export",
        started,
        vec![("config", config.to_redacted_json())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use common::storage::db::SqliteStore;

    use crate::pipeline::PipelineConfig;

    fn pipeline() -> RetrievalPipeline {
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        RetrievalPipeline::new(store, PipelineConfig::default())
    }

    #[tokio::test]
    async fn envelopes_lead_with_success_then_primary_then_meta() {
        let pipeline = pipeline();
        let value = search(&pipeline, SearchRequest::new("database config"))
            .await
            .expect("search");
        let keys: Vec<&String> = value.as_object().expect("object").keys().collect();
        assert_eq!(keys.first().map(|k| k.as_str()), Some("success"));
        assert_eq!(keys.last().map(|k| k.as_str()), Some("meta"));
        assert!(keys.iter().any(|k| *k == "results"));
    }

    #[tokio::test]
    async fn memory_operations_round_trip() {
        let pipeline = pipeline();
        remember_create(&pipeline, "s1", "note", "prefer WAL stores", None, true, None)
            .await
            .expect("create");

        let listed = remember_query(
            &pipeline,
            MemoryFilter {
                session_id: Some("s1".to_string()),
                ..MemoryFilter::default()
            },
        )
        .await
        .expect("query");
        let results = listed.get("results").and_then(Value::as_array).expect("array");
        assert_eq!(results.len(), 1);

        let removed = forget(
            &pipeline,
            None,
            Some(MemoryFilter {
                session_id: Some("s1".to_string()),
                ..MemoryFilter::default()
            }),
        )
        .await
        .expect("forget");
        assert_eq!(removed.get("removed"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn pin_span_requires_an_existing_span() {
        let pipeline = pipeline();
        let err = pin_span(&pipeline, "s1", "missing-span", None, None)
            .await
            .expect_err("missing span");
        assert!(matches!(err, PampaxError::NotFound(_)));
    }

    #[tokio::test]
    async fn multi_list_rerank_fuses_without_a_bus() {
        let pipeline = pipeline();
        let value = rerank(
            &pipeline,
            "q",
            vec![
                vec![
                    RerankInput {
                        doc_ref: "a".to_string(),
                        text: String::new(),
                    },
                    RerankInput {
                        doc_ref: "b".to_string(),
                        text: String::new(),
                    },
                ],
                vec![RerankInput {
                    doc_ref: "a".to_string(),
                    text: String::new(),
                }],
            ],
            Some("rrf_fusion"),
            None,
        )
        .await
        .expect("rerank");
        let results = value.get("results").and_then(Value::as_array).expect("array");
        assert_eq!(
            results[0].get("doc_ref").and_then(Value::as_str),
            Some("a"),
            "agreement wins"
        );
    }

    #[test]
    fn config_operations_are_pure_and_redact() {
        let mut config = AppConfig::default();
        config.embedding.api_key = Some("sk-secret".to_string());
        let shown = config_show(&config);
        assert_eq!(
            shown.pointer("/config/embedding/api_key").and_then(Value::as_str),
            Some("***")
        );
        let validated = config_validate(&config);
        assert_eq!(validated.get("valid"), Some(&json!(true)));
    }

    #[test]
    fn error_envelopes_carry_kind_code_and_correlation() {
        let err = PampaxError::Timeout("search took too long".to_string());
        let value = error_envelope("search", &err);
        assert_eq!(value.get("success"), Some(&json!(false)));
        assert_eq!(
            value.pointer("/error/kind").and_then(Value::as_str),
            Some("timeout")
        );
        assert_eq!(value.pointer("/error/code"), Some(&json!(104)));
        assert!(value.pointer("/error/correlation_id").is_some());
    }
}
