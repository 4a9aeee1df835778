use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use common::{
    error::PampaxError,
    storage::types::{
        chunk::Chunk,
        span::{Span, SpanKind},
    },
};

use crate::intent::{snake_case_variant, EntityType};

use super::{CandidateGenerator, CandidateRef, CandidateSource, GeneratorContext};

/// Resolves classified entities (function/class names) to spans by exact
/// and fuzzy name match, weighted by the policy's role preferences.
pub struct SymbolGenerator;

/// Role key a span plays for the policy weight lookup.
fn role_for(span: &Span) -> &'static str {
    if span.path.contains("test") {
        return "test";
    }
    match span.kind {
        SpanKind::Function | SpanKind::Method | SpanKind::Class | SpanKind::Interface => {
            "definition"
        }
        SpanKind::Type | SpanKind::Enum | SpanKind::Variable | SpanKind::Constant => "declaration",
        SpanKind::Module => "implementation",
        SpanKind::Import | SpanKind::Export => "reference",
    }
}

#[async_trait]
impl CandidateGenerator for SymbolGenerator {
    fn source(&self) -> CandidateSource {
        CandidateSource::Symbol
    }

    async fn generate(
        &self,
        ctx: &GeneratorContext<'_>,
        k: usize,
    ) -> Result<Vec<CandidateRef>, PampaxError> {
        if !ctx.policy.include_symbols {
            return Ok(Vec::new());
        }

        // Entity values plus their naming-convention variants.
        let mut names: Vec<String> = Vec::new();
        let mut seen_names = HashSet::new();
        for entity in &ctx.intent.entities {
            if !matches!(
                entity.entity_type,
                EntityType::Function | EntityType::Class | EntityType::EnvVar
            ) {
                continue;
            }
            for candidate in [entity.value.clone(), snake_case_variant(&entity.value)] {
                if seen_names.insert(candidate.clone()) {
                    names.push(candidate);
                }
            }
        }

        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<(Span, f32, bool)> = Vec::new();
        let mut seen_spans = HashSet::new();
        for name in &names {
            let spans = Span::by_name(
                name,
                ctx.filter.repo.as_deref(),
                true,
                k,
                ctx.store,
            )
            .await?;
            for span in spans {
                if !seen_spans.insert(span.span_id.clone()) {
                    continue;
                }
                let exact = span.name.as_deref() == Some(name.as_str());
                let weight = ctx.policy.weight(role_for(&span));
                let score = if exact { weight } else { weight * 0.6 };
                hits.push((span, score, exact));
            }
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.span_id.cmp(&b.0.span_id))
        });
        hits.truncate(k);
        debug!(hits = hits.len(), "Symbol candidates");

        let mut candidates = Vec::with_capacity(hits.len());
        for (index, (span, score, _)) in hits.into_iter().enumerate() {
            // A span without a rendered chunk cannot enter the bundle.
            let Some(chunk) = Chunk::first_for_span(&span.span_id, ctx.store).await? else {
                continue;
            };
            candidates.push(CandidateRef {
                chunk_id: chunk.chunk_id,
                source: CandidateSource::Symbol,
                raw_score: score,
                rank_in_source: index + 1,
            });
        }
        Ok(candidates)
    }
}
