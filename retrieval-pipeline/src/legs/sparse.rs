use common::{
    config::ScopedConfig,
    error::AppError,
    storage::types::chunk::{Chunk, ScoredChunk},
};
use tracing::debug;

use crate::{ChunkMatch, MatchSource, SearchContext};

use super::query_tokens;

/// Which fallback stage produced a sparse hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseEngine {
    Fts,
    FtsRelaxedOr,
    FilePath,
}

impl SparseEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fts => "fts",
            Self::FtsRelaxedOr => "fts_relaxed_or",
            Self::FilePath => "file_path",
        }
    }
}

/// Sparse leg with the three-stage fallback:
/// 1. plain conjunctive match (every meaningful token must appear),
/// 2. relaxed OR over up to `max_terms` tokens,
/// 3. file-path search when the query looks like an identifier or path.
pub async fn run(
    ctx: &SearchContext,
    corpus_ids: &[String],
    query: &str,
    config: &ScopedConfig,
) -> Result<Vec<ChunkMatch>, AppError> {
    let tokens = query_tokens(query);
    let take = config.retrieval.topk_sparse;
    let filename_like = is_filename_like(query, &tokens);

    let mut out = Vec::new();
    for corpus_id in corpus_ids {
        let (hits, engine) = search_with_fallback(ctx, corpus_id, query, &tokens, take, config).await?;

        for scored in hits {
            let mut score = scored.score;
            if filename_like {
                score *= filename_boost(&scored.chunk.file_path, &tokens, config);
            }

            let mut m = to_match(scored.chunk, score);
            m.meta_insert("sparse_engine", serde_json::json!(engine.as_str()));
            m.meta_insert(
                "sparse_relaxed",
                serde_json::json!(engine == SparseEngine::FtsRelaxedOr),
            );
            out.push(m);
        }
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    debug!(results = out.len(), "Sparse leg complete");
    Ok(out)
}

async fn search_with_fallback(
    ctx: &SearchContext,
    corpus_id: &str,
    query: &str,
    tokens: &[String],
    take: usize,
    config: &ScopedConfig,
) -> Result<(Vec<ScoredChunk>, SparseEngine), AppError> {
    // Stage 1: plain query, conjunctive over meaningful tokens.
    let hits = Chunk::fts_search(&ctx.db, corpus_id, query, take).await?;
    let plain: Vec<ScoredChunk> = hits
        .into_iter()
        .filter(|hit| contains_all_tokens(&hit.chunk.content, tokens))
        .collect();
    if !plain.is_empty() {
        return Ok((plain, SparseEngine::Fts));
    }

    // Stage 2: relaxed OR over a bounded token set.
    let or_terms: Vec<String> = tokens.iter().take(config.sparse.max_terms).cloned().collect();
    if !or_terms.is_empty() {
        let relaxed = Chunk::fts_search(&ctx.db, corpus_id, &or_terms.join(" "), take).await?;
        if !relaxed.is_empty() {
            debug!(corpus_id, "Sparse plain query empty; relaxed OR matched");
            return Ok((relaxed, SparseEngine::FtsRelaxedOr));
        }
    }

    // Stage 3: file-path prefix search for filename-like queries.
    if is_filename_like(query, tokens) {
        let chunks = Chunk::file_path_search(&ctx.db, corpus_id, tokens, take).await?;
        if !chunks.is_empty() {
            debug!(corpus_id, "Sparse FTS empty; file-path search matched");
            let scored = chunks
                .into_iter()
                .map(|chunk| ScoredChunk { chunk, score: 1.0 })
                .collect();
            return Ok((scored, SparseEngine::FilePath));
        }
    }

    Ok((Vec::new(), SparseEngine::Fts))
}

fn to_match(chunk: Chunk, score: f32) -> ChunkMatch {
    let mut m = ChunkMatch {
        chunk_id: chunk.id,
        corpus_id: chunk.corpus_id,
        content: chunk.content,
        file_path: chunk.file_path,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        language: chunk.language,
        score,
        source: MatchSource::Sparse,
        metadata: serde_json::Map::new(),
    };
    m.absorb_chunk_metadata(&chunk.metadata);
    m
}

fn contains_all_tokens(content: &str, tokens: &[String]) -> bool {
    if tokens.is_empty() {
        return false;
    }
    let lower = content.to_lowercase();
    tokens.iter().all(|token| lower.contains(token.as_str()))
}

/// Identifier/path heuristic: explicit separators, or a short run of
/// identifier-ish words.
pub fn is_filename_like(query: &str, tokens: &[String]) -> bool {
    let trimmed = query.trim();
    if trimmed.contains('/') || trimmed.contains('.') || trimmed.contains('_') {
        return true;
    }

    !tokens.is_empty()
        && tokens.len() <= 4
        && tokens
            .iter()
            .all(|t| t.len() >= 3 && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Multiplicative filename boost, always >= 1. A token equal to the file's
/// basename (with or without extension) is an exact match; a token occurring
/// inside any path component is partial.
fn filename_boost(file_path: &str, tokens: &[String], config: &ScopedConfig) -> f32 {
    if file_path.is_empty() || tokens.is_empty() {
        return 1.0;
    }

    let lower = file_path.to_lowercase();
    let basename = lower.rsplit('/').next().unwrap_or(&lower);
    let stem = basename.rsplit_once('.').map_or(basename, |(s, _)| s);

    let exact = tokens
        .iter()
        .any(|t| t.as_str() == basename || t.as_str() == stem);
    if exact {
        return config.scoring.filename_boost_exact;
    }

    let partial = lower
        .split('/')
        .any(|component| tokens.iter().any(|t| component.contains(t.as_str())));
    if partial {
        return config.scoring.filename_boost_partial;
    }

    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::SparseLegSettings;
    use common::storage::db::SurrealDbClient;
    use common::utils::embedding::EmbeddingProvider;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn context() -> SearchContext {
        let db = Arc::new(
            SurrealDbClient::memory("sparse_leg_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(3, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");
        SearchContext::new(db, Arc::new(EmbeddingProvider::new_hashed(3)))
    }

    async fn index(ctx: &SearchContext, id: &str, content: &str, path: &str) {
        Chunk::store_with_embedding(
            Chunk::new(id.into(), "repo".into(), content.into(), path.into(), 1, 10),
            vec![1.0, 0.0, 0.0],
            &ctx.db,
        )
        .await
        .expect("store chunk");
        ctx.db.rebuild_indexes().await.expect("rebuild");
    }

    #[tokio::test]
    async fn plain_conjunctive_query_wins_when_all_terms_match() {
        let ctx = context().await;
        index(&ctx, "c1", "authentication flow token refresh login", "src/auth.py").await;

        let config = ScopedConfig::default();
        let matches = run(
            &ctx,
            &["repo".to_string()],
            "authentication token refresh",
            &config,
        )
        .await
        .expect("sparse leg");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata["sparse_engine"], "fts");
        assert_eq!(matches[0].metadata["sparse_relaxed"], false);
    }

    #[tokio::test]
    async fn relaxed_or_fallback_matches_when_plain_query_is_empty() {
        let ctx = context().await;
        index(&ctx, "c1", "authentication flow token refresh login", "src/auth.py").await;

        let config = ScopedConfig::default();
        let matches = run(
            &ctx,
            &["repo".to_string()],
            "Where is the authentication flow unicorn token refresh code?",
            &config,
        )
        .await
        .expect("sparse leg");

        assert_eq!(matches.len(), 1, "relaxed OR should rescue the query");
        assert_eq!(matches[0].metadata["sparse_engine"], "fts_relaxed_or");
        assert_eq!(matches[0].metadata["sparse_relaxed"], true);
    }

    #[tokio::test]
    async fn file_path_fallback_matches_filename_queries() {
        let ctx = context().await;
        index(&ctx, "c1", "class LoginHandler: pass", "src/auth/login_controller.py").await;

        let config = ScopedConfig::default();
        let matches = run(&ctx, &["repo".to_string()], "login controller", &config)
            .await
            .expect("sparse leg");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata["sparse_engine"], "file_path");
        // Partial component match applies the partial boost.
        let expected = 1.0 * config.scoring.filename_boost_partial;
        assert!((matches[0].score - expected).abs() < 1e-5);
    }

    #[tokio::test]
    async fn no_stage_matching_yields_empty() {
        let ctx = context().await;
        index(&ctx, "c1", "completely unrelated content", "src/other.rs").await;

        let config = ScopedConfig::default();
        let matches = run(&ctx, &["repo".to_string()], "zzz qqq", &config)
            .await
            .expect("sparse leg");
        assert!(matches.is_empty());
    }

    #[test]
    fn filename_heuristic_detects_paths_and_identifiers() {
        assert!(is_filename_like("src/auth.py", &query_tokens("src/auth.py")));
        assert!(is_filename_like("login_controller", &query_tokens("login_controller")));
        assert!(is_filename_like("login controller", &query_tokens("login controller")));
        assert!(!is_filename_like(
            "how does the retrieval fusion pipeline combine legs",
            &query_tokens("how does the retrieval fusion pipeline combine legs"),
        ));
    }

    #[test]
    fn exact_basename_boost_beats_partial() {
        let config = ScopedConfig::default();
        let tokens = vec!["login_controller".to_string()];
        let exact = filename_boost("src/auth/login_controller.py", &tokens, &config);
        assert!((exact - config.scoring.filename_boost_exact).abs() < 1e-6);

        let tokens = vec!["login".to_string()];
        let partial = filename_boost("src/auth/login_controller.py", &tokens, &config);
        assert!((partial - config.scoring.filename_boost_partial).abs() < 1e-6);

        let tokens = vec!["payments".to_string()];
        let none = filename_boost("src/auth/login_controller.py", &tokens, &config);
        assert!((none - 1.0).abs() < 1e-6);
    }
}
