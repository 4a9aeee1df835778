use std::{collections::HashMap, fmt, str::FromStr};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use common::error::PampaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Symbol,
    Config,
    Api,
    Incident,
    Search,
}

impl Intent {
    pub const SCORED: [Intent; 4] = [Intent::Symbol, Intent::Config, Intent::Api, Intent::Incident];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Symbol => "symbol",
            Self::Config => "config",
            Self::Api => "api",
            Self::Incident => "incident",
            Self::Search => "search",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "symbol" => Ok(Self::Symbol),
            "config" => Ok(Self::Config),
            "api" => Ok(Self::Api),
            "incident" => Ok(Self::Incident),
            "search" => Ok(Self::Search),
            other => Err(format!("unknown intent '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Function,
    Class,
    File,
    Route,
    EnvVar,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentEntity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f32,
    pub entities: Vec<IntentEntity>,
    pub suggested_policies: Vec<String>,
}

/// Caller-supplied context hints; they do not change scoring, only the
/// downstream policy.
#[derive(Debug, Clone, Default)]
pub struct QueryHints {
    pub language: Option<String>,
    pub repo: Option<String>,
}

struct IntentPatterns {
    keywords: &'static [&'static str],
    /// Structural signals counted as non-exact matches.
    patterns: Vec<Regex>,
}

/// Weighted keyword/pattern scorer with per-type entity extraction.
/// Classification is pure string work and stays well under a millisecond
/// on realistic queries.
pub struct IntentClassifier {
    intents: HashMap<Intent, IntentPatterns>,
    thresholds: HashMap<Intent, f32>,
    function_snake: Regex,
    function_camel: Regex,
    class_pascal: Regex,
    file_token: Regex,
    route_template: Regex,
    env_var: Regex,
}

const DEFAULT_THRESHOLD: f32 = 0.2;

const SYMBOL_KEYWORDS: &[&str] = &[
    "function", "method", "class", "struct", "interface", "definition", "declaration", "symbol",
    "impl",
];
const CONFIG_KEYWORDS: &[&str] = &[
    "config", "configuration", "setting", "settings", "env", "environment", "toml", "yaml",
    "ini", "property", "properties", "flag",
];
const API_KEYWORDS: &[&str] = &[
    "api", "endpoint", "route", "handler", "request", "response", "rest", "http",
];
const INCIDENT_KEYWORDS: &[&str] = &[
    "error", "exception", "panic", "crash", "bug", "failure", "failing", "broken", "null",
    "stacktrace", "traceback", "timeout", "incident", "regression",
];

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier {
    pub fn new() -> Self {
        let function_camel =
            Regex::new(r"\b[a-z][a-z0-9]*[A-Z][A-Za-z0-9]*\b").expect("static regex");
        let function_snake =
            Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("static regex");
        let class_pascal =
            Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").expect("static regex");
        let file_token =
            Regex::new(r"\b[\w./-]+\.(?:rs|py|js|jsx|ts|tsx|go|java|rb|c|cpp|h|toml|yaml|yml|json|ini|md)\b")
                .expect("static regex");
        let route_template =
            Regex::new(r"(?:/[A-Za-z0-9_{}:.\-]+){1,}").expect("static regex");
        let env_var = Regex::new(r"\b[A-Z][A-Z0-9]*(?:_[A-Z0-9]+)+\b").expect("static regex");
        let http_method =
            Regex::new(r"\b(?:GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS)\b").expect("static regex");

        let mut intents = HashMap::new();
        intents.insert(
            Intent::Symbol,
            IntentPatterns {
                keywords: SYMBOL_KEYWORDS,
                patterns: vec![function_camel.clone(), function_snake.clone()],
            },
        );
        intents.insert(
            Intent::Config,
            IntentPatterns {
                keywords: CONFIG_KEYWORDS,
                patterns: vec![env_var.clone()],
            },
        );
        intents.insert(
            Intent::Api,
            IntentPatterns {
                keywords: API_KEYWORDS,
                patterns: vec![http_method, route_template.clone()],
            },
        );
        intents.insert(
            Intent::Incident,
            IntentPatterns {
                keywords: INCIDENT_KEYWORDS,
                patterns: Vec::new(),
            },
        );

        let thresholds = Intent::SCORED
            .iter()
            .map(|intent| (*intent, DEFAULT_THRESHOLD))
            .collect();

        Self {
            intents,
            thresholds,
            function_snake,
            function_camel,
            class_pascal,
            file_token,
            route_template,
            env_var,
        }
    }

    pub fn with_threshold(mut self, intent: Intent, threshold: f32) -> Self {
        self.thresholds.insert(intent, threshold);
        self
    }

    pub fn classify(
        &self,
        query: &str,
        _hints: Option<&QueryHints>,
    ) -> Result<IntentResult, PampaxError> {
        if query.trim().is_empty() {
            return Err(PampaxError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        let lowered = query.to_ascii_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .collect();

        let mut best: Option<(Intent, f32)> = None;
        let mut highest_observed = 0.0f32;

        for intent in Intent::SCORED {
            let Some(patterns) = self.intents.get(&intent) else {
                continue;
            };

            let exact_matches = patterns
                .keywords
                .iter()
                .copied()
                .filter(|keyword| tokens.contains(keyword))
                .count();
            let pattern_matches = patterns
                .patterns
                .iter()
                .filter(|regex| regex.is_match(query))
                .count();
            let matches = exact_matches + pattern_matches;
            if matches == 0 {
                continue;
            }

            // Base ratio: how much of the query this intent accounts for.
            let base_ratio = (matches as f32 / tokens.len().max(1) as f32).min(1.0);
            let exact_bonus = if exact_matches > 0 { 0.2 } else { 0.0 };
            let additional_bonus = 0.1 * (matches.saturating_sub(1)) as f32;
            let confidence = (base_ratio + exact_bonus + additional_bonus).min(1.0);

            trace!(intent = %intent, matches, confidence, "Intent scored");
            highest_observed = highest_observed.max(confidence);

            let threshold = self
                .thresholds
                .get(&intent)
                .copied()
                .unwrap_or(DEFAULT_THRESHOLD);
            if confidence > threshold {
                match best {
                    Some((_, best_confidence)) if best_confidence >= confidence => {}
                    _ => best = Some((intent, confidence)),
                }
            }
        }

        let (intent, confidence) = best.unwrap_or((Intent::Search, highest_observed));
        let entities = self.extract_entities(query);

        Ok(IntentResult {
            intent,
            confidence,
            entities,
            suggested_policies: vec![format!("{intent}-default")],
        })
    }

    fn extract_entities(&self, query: &str) -> Vec<IntentEntity> {
        let mut entities = Vec::new();
        let mut push = |entity_type: EntityType, regex: &Regex| {
            for found in regex.find_iter(query) {
                entities.push(IntentEntity {
                    entity_type,
                    value: found.as_str().to_owned(),
                    position: found.start(),
                });
            }
        };

        push(EntityType::File, &self.file_token);
        push(EntityType::Route, &self.route_template);
        push(EntityType::EnvVar, &self.env_var);
        push(EntityType::Class, &self.class_pascal);
        push(EntityType::Function, &self.function_camel);
        push(EntityType::Function, &self.function_snake);

        // Drop overlapping later matches (a file token also matches the
        // snake-case battery, the file wins by extraction order).
        let mut kept: Vec<IntentEntity> = Vec::with_capacity(entities.len());
        for entity in entities {
            let overlaps = kept.iter().any(|existing| {
                let a = existing.position..existing.position + existing.value.len();
                let b = entity.position..entity.position + entity.value.len();
                a.start < b.end && b.start < a.end
            });
            if !overlaps {
                kept.push(entity);
            }
        }
        kept.sort_by_key(|entity| entity.position);
        kept
    }
}

/// camelCase / PascalCase to snake_case, for symbol lookups that must hit
/// either convention.
pub fn snake_case_variant(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
