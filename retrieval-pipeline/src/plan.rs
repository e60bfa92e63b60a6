use common::config::ScopedConfig;

use crate::{QueryIntent, SearchSpec};

/// The resolved execution plan for one request.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub vector: bool,
    pub sparse: bool,
    pub graph: bool,
    pub final_k: usize,
    /// Query variants, original first. Only the canonical query feeds the
    /// legs today; variants ride along for the sparse relaxed stage and
    /// future multi-query execution.
    pub variants: Vec<String>,
    pub intent: Option<QueryIntent>,
}

/// Active legs = requested flags ∩ enabled flags; `final_k` is the request
/// override clamped to [1, 100], else the configured default.
pub fn build_plan(spec: &SearchSpec, config: &ScopedConfig) -> QueryPlan {
    let final_k = spec
        .top_k
        .map(|k| k.clamp(1, 100))
        .unwrap_or(config.retrieval.final_k);

    let variants = if config.retrieval.query_expansion_enabled {
        expand_query(&spec.query, config.retrieval.multi_query_m)
    } else {
        vec![spec.query.clone()]
    };

    QueryPlan {
        vector: spec.include_vector && config.vector.enabled,
        sparse: spec.include_sparse && config.sparse.enabled,
        graph: spec.include_graph && config.graph.enabled,
        final_k,
        variants,
        intent: spec.intent,
    }
}

/// Deterministic synonym table. Each (abbreviation, expansion) pair rewrites
/// in both directions; no model call is involved.
const SYNONYMS: &[(&str, &str)] = &[
    ("auth", "authentication"),
    ("config", "configuration"),
    ("db", "database"),
    ("repo", "repository"),
    ("fn", "function"),
    ("func", "function"),
    ("init", "initialize"),
    ("err", "error"),
    ("dir", "directory"),
    ("doc", "documentation"),
    ("docs", "documentation"),
    ("embed", "embedding"),
    ("param", "parameter"),
    ("msg", "message"),
];

/// Produce up to `limit` query variants. The original query is canonical and
/// always first; each variant substitutes exactly one token.
pub fn expand_query(query: &str, limit: usize) -> Vec<String> {
    let mut variants = vec![query.to_string()];
    if limit <= 1 {
        return variants;
    }

    let tokens: Vec<&str> = query.split_whitespace().collect();

    'outer: for (index, token) in tokens.iter().enumerate() {
        let lowered = token.to_lowercase();
        let stripped = lowered.trim_matches(|c: char| !c.is_alphanumeric());

        for (abbrev, expansion) in SYNONYMS {
            let replacement = if stripped == *abbrev {
                Some(*expansion)
            } else if stripped == *expansion {
                Some(*abbrev)
            } else {
                None
            };

            if let Some(replacement) = replacement {
                let mut rewritten: Vec<String> =
                    tokens.iter().map(|t| (*t).to_string()).collect();
                if let Some(slot) = rewritten.get_mut(index) {
                    *slot = replacement.to_string();
                }
                let candidate = rewritten.join(" ");
                if !variants.contains(&candidate) {
                    variants.push(candidate);
                }
                if variants.len() >= limit {
                    break 'outer;
                }
            }
        }
    }

    variants
}

/// Parse a short intent tag from the request, if present.
pub fn parse_intent(tag: &str) -> Option<QueryIntent> {
    match tag.trim().to_lowercase().as_str() {
        "gui" => Some(QueryIntent::Gui),
        "retrieval" => Some(QueryIntent::Retrieval),
        "indexer" => Some(QueryIntent::Indexer),
        "eval" => Some(QueryIntent::Eval),
        "infra" => Some(QueryIntent::Infra),
        "server" => Some(QueryIntent::Server),
        _ => None,
    }
}
