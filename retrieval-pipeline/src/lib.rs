//! The PAMPAX retrieval core: the end-to-end path from a query string to a
//! ranked, token-budgeted context bundle.

pub mod fusion;
pub mod generators;
pub mod graph;
pub mod intent;
pub mod ops;
pub mod packing;
pub mod pipeline;
pub mod policy;
pub mod reranking;
pub mod scoring;
pub mod signature;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::utils::hash::sha256_hex_parts;
use intent::Intent;

pub use pipeline::{AssembleRequest, RetrievalPipeline, SearchRequest, SearchResult};

/// Pointer back into the span table carried on every bundle item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRef {
    pub span_id: String,
    pub path: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub kind: String,
    pub name: Option<String>,
}

impl SpanRef {
    pub fn from_span(span: &common::storage::types::span::Span) -> Self {
        Self {
            span_id: span.span_id.clone(),
            path: span.path.clone(),
            byte_start: span.byte_start,
            byte_end: span.byte_end,
            kind: span.kind.as_str().to_owned(),
            name: span.name.clone(),
        }
    }
}

/// One packed entry in a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleItem {
    pub span_ref: Option<SpanRef>,
    pub chunk_id: String,
    pub chunk_content: String,
    /// Contributing sources joined with `+`, e.g. `fts+vector`.
    pub source: String,
    pub score: f32,
    pub rank: usize,
    pub reasons: Vec<String>,
    pub tier: String,
    pub content_kind: String,
    pub original_tokens: usize,
    pub packed_tokens: usize,
    pub degradation_level: u8,
}

/// Accounting for the packed bundle against its budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenReport {
    pub budget: usize,
    pub est_used: usize,
    pub actual: usize,
    pub model: String,
    pub per_tier: BTreeMap<String, usize>,
    pub degradation_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonCategory {
    Resource,
    Quality,
    Performance,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonSeverity {
    Info,
    Warning,
    Critical,
}

/// Why the pipeline stopped short of the ideal bundle. Recoverable
/// component failures surface here instead of failing the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoppingReason {
    pub category: ReasonCategory,
    pub severity: ReasonSeverity,
    pub message: String,
    pub hint: Option<String>,
}

impl StoppingReason {
    pub fn new(category: ReasonCategory, severity: ReasonSeverity, message: String) -> Self {
        Self {
            category,
            severity,
            message,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_owned());
        self
    }
}

/// The token-budgeted, ordered result of an assemble call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    pub query: String,
    pub intent: Intent,
    pub items: Vec<BundleItem>,
    pub token_report: TokenReport,
    pub degradation_level: u8,
    pub stopping_reasons: Vec<StoppingReason>,
}

impl Bundle {
    /// Stable id for persistence and the signature cache.
    pub fn bundle_id(&self) -> String {
        let item_ids: Vec<&str> = self.items.iter().map(|i| i.chunk_id.as_str()).collect();
        sha256_hex_parts(&[&self.query, self.intent.as_str(), &item_ids.join(",")])
    }

    /// Outcome-analysis signature: sorted per-source item counts, intent,
    /// and bucketed token/budget usage.
    pub fn signature(&self) -> String {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for item in &self.items {
            for source in item.source.split('+') {
                *counts.entry(source.to_owned()).or_default() += 1;
            }
        }
        let counts: Vec<String> = counts
            .into_iter()
            .map(|(source, count)| format!("{source}:{count}"))
            .collect();
        let token_bucket = (self.token_report.actual / 512).to_string();
        let budget_bucket = (self.token_report.budget / 1024).to_string();
        sha256_hex_parts(&[
            &counts.join(","),
            self.intent.as_str(),
            &token_bucket,
            &budget_bucket,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_sources(sources: &[&str]) -> Bundle {
        Bundle {
            query: "q".to_string(),
            intent: Intent::Search,
            items: sources
                .iter()
                .enumerate()
                .map(|(rank, source)| BundleItem {
                    span_ref: None,
                    chunk_id: format!("c{rank}"),
                    chunk_content: String::new(),
                    source: (*source).to_string(),
                    score: 1.0,
                    rank,
                    reasons: Vec::new(),
                    tier: "must_have".to_string(),
                    content_kind: "code".to_string(),
                    original_tokens: 10,
                    packed_tokens: 10,
                    degradation_level: 0,
                })
                .collect(),
            token_report: TokenReport {
                budget: 2000,
                est_used: 20,
                actual: 20,
                model: "claude-3-sonnet".to_string(),
                per_tier: BTreeMap::new(),
                degradation_level: 0,
            },
            degradation_level: 0,
            stopping_reasons: Vec::new(),
        }
    }

    #[test]
    fn signatures_depend_on_source_mix_not_order() {
        let a = bundle_with_sources(&["fts", "vector"]);
        let b = bundle_with_sources(&["vector", "fts"]);
        assert_eq!(a.signature(), b.signature());

        let c = bundle_with_sources(&["fts", "fts"]);
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn bundle_ids_change_with_content() {
        let a = bundle_with_sources(&["fts"]);
        let b = bundle_with_sources(&["fts", "vector"]);
        assert_ne!(a.bundle_id(), b.bundle_id());
    }
}
