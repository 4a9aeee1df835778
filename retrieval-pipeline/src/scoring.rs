use std::cmp::Ordering;

/// Clamp a score into the unit interval.
pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

/// Descending score sort with a lexicographic id tie-break so output order
/// is a pure function of input.
pub fn sort_desc_by<T>(items: &mut [T], score: impl Fn(&T) -> f32, id: impl Fn(&T) -> String) {
    items.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| id(a).cmp(&id(b)))
    });
}

/// Share of query terms present in the haystack, used for lexical boosts
/// and the mock reranker.
pub fn lexical_overlap_score(terms: &[String], haystack: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = haystack.to_ascii_lowercase();
    let mut matches = 0usize;
    for term in terms {
        if lower.contains(term) {
            matches += 1;
        }
    }
    (matches as f32) / (terms.len() as f32)
}

/// Lowercased alphanumeric terms of length >= 3, sorted and deduplicated.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        let term = raw.trim().to_ascii_lowercase();
        if term.len() >= 3 {
            terms.push(term);
        }
    }
    terms.sort();
    terms.dedup();
    terms
}
