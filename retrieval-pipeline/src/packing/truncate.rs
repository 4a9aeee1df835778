use common::{storage::types::packing_profile::TruncationStrategy, tokenizer::TokenizerFactory};

pub const TRUNCATION_MARKER: &str = "… [truncated]";

/// Shrink `content` under `max_tokens` with the profile's strategy,
/// preserving the declared prefix/suffix markers. Returns `None` when even
/// a minimal rendition cannot fit.
pub fn truncate(
    content: &str,
    strategy: TruncationStrategy,
    max_tokens: usize,
    tokenizers: &TokenizerFactory,
    model: &str,
) -> Option<String> {
    if max_tokens < 8 {
        return None;
    }
    if tokenizers.count(model, content).count <= max_tokens {
        return Some(content.to_owned());
    }

    // Start from a char budget implied by the family ratio and shrink
    // geometrically until the measured count fits.
    let mut keep_chars = max_tokens.saturating_mul(4);
    for _ in 0..8 {
        if keep_chars < 16 {
            return None;
        }
        let candidate = render(content, strategy, keep_chars);
        if tokenizers.count(model, &candidate).count <= max_tokens {
            return Some(candidate);
        }
        keep_chars = keep_chars * 7 / 10;
    }
    None
}

fn render(content: &str, strategy: TruncationStrategy, keep_chars: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= keep_chars {
        return content.to_owned();
    }

    match strategy {
        TruncationStrategy::Head => {
            let head: String = chars.iter().take(keep_chars).collect();
            format!("{head}\n{TRUNCATION_MARKER}")
        }
        TruncationStrategy::Tail => {
            let tail: String = chars[chars.len() - keep_chars..].iter().collect();
            format!("{TRUNCATION_MARKER}\n{tail}")
        }
        TruncationStrategy::Middle => {
            let half = keep_chars / 2;
            let head: String = chars.iter().take(half).collect();
            let tail: String = chars[chars.len() - half..].iter().collect();
            format!("{head}\n{TRUNCATION_MARKER}\n{tail}")
        }
        TruncationStrategy::Smart => {
            // Keep declaration-looking lines first, then fill from the top.
            let mut kept: Vec<&str> = Vec::new();
            let mut used = 0usize;
            for line in content.lines() {
                let trimmed = line.trim_start();
                let is_decl = trimmed.starts_with("def ")
                    || trimmed.starts_with("fn ")
                    || trimmed.starts_with("class ")
                    || trimmed.starts_with("pub ")
                    || trimmed.starts_with("function ");
                if is_decl && used + line.len() <= keep_chars {
                    kept.push(line);
                    used += line.len();
                }
            }
            for line in content.lines() {
                if kept.contains(&line) {
                    continue;
                }
                if used + line.len() > keep_chars {
                    break;
                }
                kept.push(line);
                used += line.len();
            }
            format!("{}\n{TRUNCATION_MARKER}", kept.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::TokenizerConfig;

    fn factory() -> TokenizerFactory {
        TokenizerFactory::new(TokenizerConfig::default(), 64)
    }

    #[test]
    fn head_keeps_the_prefix_and_marks_the_cut() {
        let content = "first line\n".repeat(200);
        let truncated = truncate(
            &content,
            TruncationStrategy::Head,
            50,
            &factory(),
            "gpt-4o",
        )
        .expect("fits");
        assert!(truncated.starts_with("first line"));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert!(factory().count("gpt-4o", &truncated).count <= 50);
    }

    #[test]
    fn tail_keeps_the_suffix() {
        let mut content = "filler\n".repeat(200);
        content.push_str("the final line");
        let truncated = truncate(
            &content,
            TruncationStrategy::Tail,
            50,
            &factory(),
            "gpt-4o",
        )
        .expect("fits");
        assert!(truncated.starts_with(TRUNCATION_MARKER));
        assert!(truncated.ends_with("the final line"));
    }

    #[test]
    fn middle_preserves_both_ends() {
        let content = format!("start marker\n{}\nend marker", "x\n".repeat(400));
        let truncated = truncate(
            &content,
            TruncationStrategy::Middle,
            60,
            &factory(),
            "gpt-4o",
        )
        .expect("fits");
        assert!(truncated.starts_with("start"));
        assert!(truncated.ends_with("marker"));
        assert!(truncated.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn already_fitting_content_is_untouched() {
        let content = "short body";
        let truncated = truncate(
            content,
            TruncationStrategy::Smart,
            50,
            &factory(),
            "gpt-4o",
        )
        .expect("fits");
        assert_eq!(truncated, content);
    }

    #[test]
    fn impossible_budgets_return_none() {
        assert!(truncate("anything", TruncationStrategy::Head, 2, &factory(), "gpt-4o").is_none());
    }
}
