use std::collections::BTreeSet;

use common::{storage::types::span::Span, tokenizer::TokenizerFactory};

/// Deterministic reduced form of a chunk: signature, first doc paragraph,
/// and up to three key-line excerpts, capped at `max_tokens`.
pub fn build(
    span: Option<&Span>,
    content: &str,
    max_tokens: usize,
    signature_only: bool,
    tokenizers: &TokenizerFactory,
    model: &str,
) -> String {
    let signature = span
        .and_then(|s| s.signature.clone())
        .or_else(|| {
            content
                .lines()
                .find(|line| !line.trim().is_empty())
                .map(str::to_owned)
        })
        .unwrap_or_default();

    if signature_only {
        return signature;
    }

    let doc_paragraph = span
        .and_then(|s| s.doc.as_deref())
        .map(first_paragraph)
        .unwrap_or_default();

    let name = span.and_then(|s| s.name.as_deref()).unwrap_or_default();
    let key_lines: Vec<&str> = content
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && trimmed != signature.trim()
                && !name.is_empty()
                && trimmed.contains(name)
        })
        .take(3)
        .collect();

    let mut sections: Vec<String> = Vec::with_capacity(3);
    if !signature.is_empty() {
        sections.push(signature.clone());
    }
    if !doc_paragraph.is_empty() {
        sections.push(doc_paragraph);
    }
    if !key_lines.is_empty() {
        sections.push(key_lines.join("\n"));
    }

    // Trim sections from the back until the capsule fits.
    loop {
        let capsule = sections.join("\n");
        if tokenizers.count(model, &capsule).count <= max_tokens || sections.len() <= 1 {
            return capsule;
        }
        sections.pop();
    }
}

fn first_paragraph(doc: &str) -> String {
    doc.split("\n\n")
        .next()
        .unwrap_or("")
        .trim()
        .to_owned()
}

/// Identifier-ish tokens a reduction must preserve: drawn from the span
/// signature, name, and leading doc paragraph.
pub fn anchor_tokens(span: Option<&Span>, content: &str) -> BTreeSet<String> {
    let mut basis = String::new();
    match span {
        Some(span) => {
            if let Some(signature) = &span.signature {
                basis.push_str(signature);
                basis.push(' ');
            }
            if let Some(name) = &span.name {
                basis.push_str(name);
                basis.push(' ');
            }
            if let Some(doc) = &span.doc {
                basis.push_str(&first_paragraph(doc));
            }
        }
        None => {
            if let Some(first) = content.lines().find(|line| !line.trim().is_empty()) {
                basis.push_str(first);
            }
        }
    }

    basis
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2)
        .map(str::to_owned)
        .collect()
}

/// Share of anchor tokens still present in the reduced text.
pub fn structural_similarity(anchors: &BTreeSet<String>, reduced: &str) -> f32 {
    if anchors.is_empty() {
        return 1.0;
    }
    let retained = anchors
        .iter()
        .filter(|t| reduced.contains(t.as_str()))
        .count();
    retained as f32 / anchors.len() as f32
}
