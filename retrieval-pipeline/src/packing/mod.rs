pub mod capsule;
pub mod degrade;
pub mod truncate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use common::{
    storage::types::{
        packing_profile::PackingProfile,
        policy_row::PolicyDecision,
        span::{Span, SpanKind},
    },
    tokenizer::TokenizerFactory,
};

use crate::{
    intent::Intent, BundleItem, ReasonCategory, ReasonSeverity, SpanRef, StoppingReason,
    TokenReport,
};

use degrade::{DegradeLevel, SIMILARITY_FLOOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Tests,
    Code,
    Comments,
    Examples,
    Config,
    Docs,
}

impl ContentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tests => "tests",
            Self::Code => "code",
            Self::Comments => "comments",
            Self::Examples => "examples",
            Self::Config => "config",
            Self::Docs => "docs",
        }
    }
}

/// Classify by path heuristics first, then span kind, then content shape.
pub fn classify_content(path: &str, span: Option<&Span>, content: &str) -> ContentKind {
    let lowered = path.to_ascii_lowercase();
    if lowered.contains("test") {
        return ContentKind::Tests;
    }
    if lowered.contains("example") || lowered.contains("demo") {
        return ContentKind::Examples;
    }
    let extension = lowered.rsplit('.').next().unwrap_or("");
    if matches!(extension, "toml" | "yaml" | "yml" | "json" | "ini" | "env" | "cfg" | "conf")
        || lowered.contains("config")
    {
        return ContentKind::Config;
    }
    if matches!(extension, "md" | "rst" | "txt") {
        return ContentKind::Docs;
    }
    if let Some(span) = span {
        if matches!(span.kind, SpanKind::Module) && span.doc.is_some() {
            return ContentKind::Docs;
        }
    }

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if !lines.is_empty() {
        let comment_lines = lines
            .iter()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("//") || t.starts_with('#') || t.starts_with("/*") || t.starts_with('*')
            })
            .count();
        if comment_lines * 10 > lines.len() * 6 {
            return ContentKind::Comments;
        }
    }
    ContentKind::Code
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    MustHave,
    Important,
    Supplementary,
    Optional,
}

impl Tier {
    pub const ORDER: [Tier; 4] = [
        Tier::MustHave,
        Tier::Important,
        Tier::Supplementary,
        Tier::Optional,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MustHave => "must_have",
            Self::Important => "important",
            Self::Supplementary => "supplementary",
            Self::Optional => "optional",
        }
    }

    pub const fn promote(self) -> Self {
        match self {
            Self::MustHave | Self::Important => Self::MustHave,
            Self::Supplementary => Self::Important,
            Self::Optional => Self::Supplementary,
        }
    }

    fn share(self, profile: &PackingProfile) -> f32 {
        match self {
            Self::MustHave => profile.tier_shares.must_have,
            Self::Important => profile.tier_shares.important,
            Self::Supplementary => profile.tier_shares.supplementary,
            Self::Optional => profile.tier_shares.optional,
        }
    }
}

/// Content kind promoted one tier for the given intent.
const fn boosted_kind(intent: Intent) -> Option<ContentKind> {
    match intent {
        Intent::Incident => Some(ContentKind::Tests),
        Intent::Config => Some(ContentKind::Config),
        Intent::Symbol | Intent::Api | Intent::Search => None,
    }
}

/// Candidate entering the packer, already hydrated and fused.
#[derive(Debug, Clone)]
pub struct PackCandidate {
    pub chunk_id: String,
    pub content: String,
    pub span: Option<Span>,
    pub sources: Vec<String>,
    pub score: f32,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PackOutcome {
    pub items: Vec<BundleItem>,
    pub token_report: TokenReport,
    pub degradation_level: u8,
    pub stopping_reasons: Vec<StoppingReason>,
}

pub struct PackingEngine;

impl PackingEngine {
    /// Pack candidates into tiers under the measured token budget. Items
    /// degrade (capsule, truncate, signature-only) before they are ever
    /// dropped; must-have items are only dropped with an Emergency
    /// stopping reason.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(candidates = candidates.len(), budget = token_budget))]
    pub fn pack(
        &self,
        mut candidates: Vec<PackCandidate>,
        model: &str,
        intent: Intent,
        policy: &PolicyDecision,
        profile: &PackingProfile,
        token_budget: usize,
        tokenizers: &TokenizerFactory,
    ) -> PackOutcome {
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let total = candidates.len();
        let mut tiered: Vec<(Tier, ContentKind, PackCandidate, usize)> = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, candidate)| {
                let kind = classify_content(
                    candidate
                        .span
                        .as_ref()
                        .map(|s| s.path.as_str())
                        .unwrap_or(""),
                    candidate.span.as_ref(),
                    &candidate.content,
                );
                let mut tier = tier_for_rank(rank, total);
                if boosted_kind(intent) == Some(kind) {
                    tier = tier.promote();
                }
                let original_tokens = tokenizers.count(model, &candidate.content).count;
                (tier, kind, candidate, original_tokens)
            })
            .collect();
        tiered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut items: Vec<BundleItem> = Vec::new();
        let mut stopping_reasons: Vec<StoppingReason> = Vec::new();
        let mut per_tier: BTreeMap<String, usize> = BTreeMap::new();
        let mut level = DegradeLevel::None;
        let mut total_spent = 0usize;
        let mut est_used = 0usize;
        let mut skipped = 0usize;
        let mut rollover = 0usize;

        let reserve = (token_budget as f32 * profile.tier_shares.reserve) as usize;

        for tier in Tier::ORDER {
            let mut tier_budget =
                (token_budget as f32 * tier.share(profile)) as usize + rollover;
            if tier == Tier::MustHave {
                tier_budget += reserve;
            }
            let mut tier_spent = 0usize;
            let mut tier_total = 0usize;
            let mut tier_skipped = 0usize;

            for (item_tier, kind, candidate, original_tokens) in &tiered {
                if *item_tier != tier {
                    continue;
                }
                tier_total += 1;

                let remaining_tier = tier_budget.saturating_sub(tier_spent);
                let remaining_total = token_budget.saturating_sub(total_spent);
                let limit = remaining_tier.min(remaining_total);

                match self.render(
                    candidate,
                    *original_tokens,
                    tier,
                    limit,
                    policy,
                    profile,
                    model,
                    tokenizers,
                ) {
                    Some((content, packed_tokens, item_level)) => {
                        level = level.max(item_level);
                        tier_spent += packed_tokens;
                        total_spent += packed_tokens;
                        est_used += original_tokens;
                        *per_tier.entry(tier.as_str().to_owned()).or_default() +=
                            packed_tokens;
                        items.push(BundleItem {
                            span_ref: candidate.span.as_ref().map(SpanRef::from_span),
                            chunk_id: candidate.chunk_id.clone(),
                            chunk_content: content,
                            source: candidate.sources.join("+"),
                            score: candidate.score,
                            rank: 0,
                            reasons: candidate.reasons.clone(),
                            tier: tier.as_str().to_owned(),
                            content_kind: kind.as_str().to_owned(),
                            original_tokens: *original_tokens,
                            packed_tokens,
                            degradation_level: item_level.as_u8(),
                        });
                    }
                    None => {
                        skipped += 1;
                        tier_skipped += 1;
                        if tier == Tier::MustHave {
                            level = level.max(DegradeLevel::Emergency);
                            stopping_reasons.push(
                                StoppingReason::new(
                                    ReasonCategory::Resource,
                                    ReasonSeverity::Critical,
                                    format!(
                                        "must-have item {} does not fit even as a signature capsule \
                                         ({total_spent} of {token_budget} tokens used)",
                                        candidate.chunk_id
                                    ),
                                )
                                .with_hint("raise the token budget"),
                            );
                        }
                    }
                }
            }

            if tier_total > 0 && tier_skipped == tier_total && tier != Tier::MustHave {
                level = level.max(DegradeLevel::for_drop(tier));
            }
            rollover = tier_budget.saturating_sub(tier_spent);
        }

        if skipped > 0 {
            stopping_reasons.push(
                StoppingReason::new(
                    ReasonCategory::Resource,
                    ReasonSeverity::Warning,
                    format!(
                        "token budget exhausted: packed {total_spent} of {token_budget} budget \
                         tokens; {skipped} candidate(s) skipped"
                    ),
                )
                .with_hint("raise token_budget or narrow the query"),
            );
        } else if level >= DegradeLevel::Moderate {
            stopping_reasons.push(StoppingReason::new(
                ReasonCategory::Resource,
                ReasonSeverity::Info,
                format!(
                    "token budget pressure: packed {total_spent} of {token_budget} budget tokens \
                     at degradation level {}",
                    level.as_u8()
                ),
            ));
        }

        for (rank, item) in items.iter_mut().enumerate() {
            item.rank = rank;
        }

        debug!(
            items = items.len(),
            actual = total_spent,
            budget = token_budget,
            level = level.as_u8(),
            "Packed bundle"
        );

        PackOutcome {
            items,
            token_report: TokenReport {
                budget: token_budget,
                est_used,
                actual: total_spent,
                model: model.to_owned(),
                per_tier,
                degradation_level: level.as_u8(),
            },
            degradation_level: level.as_u8(),
            stopping_reasons,
        }
    }

    /// Render one candidate under `limit` tokens: full content, then a
    /// capsule, then truncation, then (must-have only) a signature-only
    /// capsule. `None` means the item cannot be placed.
    #[allow(clippy::too_many_arguments)]
    fn render(
        &self,
        candidate: &PackCandidate,
        original_tokens: usize,
        tier: Tier,
        limit: usize,
        policy: &PolicyDecision,
        profile: &PackingProfile,
        model: &str,
        tokenizers: &TokenizerFactory,
    ) -> Option<(String, usize, DegradeLevel)> {
        if limit == 0 && tier != Tier::MustHave {
            return None;
        }

        if policy.include_content && original_tokens <= limit {
            return Some((candidate.content.clone(), original_tokens, DegradeLevel::None));
        }

        let anchors = capsule::anchor_tokens(candidate.span.as_ref(), &candidate.content);
        let reduced = capsule::build(
            candidate.span.as_ref(),
            &candidate.content,
            profile.capsule_max_tokens,
            false,
            tokenizers,
            model,
        );
        let capsule_tokens = tokenizers.count(model, &reduced).count;
        if capsule_tokens <= limit
            && capsule::structural_similarity(&anchors, &reduced) >= SIMILARITY_FLOOR
        {
            return Some((reduced, capsule_tokens, DegradeLevel::for_forced_capsule(tier)));
        }

        if policy.include_content && tier != Tier::MustHave {
            if let Some(truncated) =
                truncate::truncate(&candidate.content, profile.truncation, limit, tokenizers, model)
            {
                let tokens = tokenizers.count(model, &truncated).count;
                return Some((truncated, tokens, DegradeLevel::for_forced_capsule(tier)));
            }
        }

        if tier == Tier::MustHave {
            let signature = capsule::build(
                candidate.span.as_ref(),
                &candidate.content,
                profile.capsule_max_tokens,
                true,
                tokenizers,
                model,
            );
            let tokens = tokenizers.count(model, &signature).count;
            if tokens <= limit && !signature.is_empty() {
                return Some((signature, tokens, DegradeLevel::Emergency));
            }
        }

        None
    }
}

fn tier_for_rank(rank: usize, total: usize) -> Tier {
    if total == 0 {
        return Tier::Optional;
    }
    // Top decile (at least one) is must-have, then 30/30/30.
    let must = (total / 10).max(1);
    let important = must + (total * 3).div_ceil(10);
    let supplementary = important + (total * 3).div_ceil(10);
    if rank < must {
        Tier::MustHave
    } else if rank < important {
        Tier::Important
    } else if rank < supplementary {
        Tier::Supplementary
    } else {
        Tier::Optional
    }
}
