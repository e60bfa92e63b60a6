pub mod debug;
pub mod dispatch;
pub mod fusion;
pub mod hydrate;
pub mod legs;
pub mod plan;
pub mod recall;
pub mod rerank;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use common::{
    config::ScopedConfig,
    storage::db::SurrealDbClient,
    utils::embedding::EmbeddingProvider,
};

use debug::FusionDebug;
use rerank::RerankerRegistry;

/// Which retrieval source produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Vector,
    Sparse,
    Graph,
    Fused,
}

/// A chunk plus its retrieval annotations. Legs emit these with leg-local
/// scores; fusion re-emits them with fused scores and `source = fused`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub corpus_id: String,
    pub content: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: Option<String>,
    pub score: f32,
    pub source: MatchSource,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChunkMatch {
    /// A match known only by id and score; content arrives at hydration.
    pub fn skeletal(chunk_id: String, corpus_id: String, score: f32, source: MatchSource) -> Self {
        Self {
            chunk_id,
            corpus_id,
            content: String::new(),
            file_path: String::new(),
            start_line: 0,
            end_line: 0,
            language: None,
            score,
            source,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn meta_insert(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    /// Merge a chunk's stored metadata map into the match. Leg-provided
    /// annotations win on key collisions.
    pub fn absorb_chunk_metadata(&mut self, metadata: &serde_json::Value) {
        if let Some(map) = metadata.as_object() {
            for (key, value) in map {
                self.metadata
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// Query intent tag used by the layer-bonus matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Gui,
    Retrieval,
    Indexer,
    Eval,
    Infra,
    Server,
}

impl QueryIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gui => "gui",
            Self::Retrieval => "retrieval",
            Self::Indexer => "indexer",
            Self::Eval => "eval",
            Self::Infra => "infra",
            Self::Server => "server",
        }
    }
}

/// One retrieval request as the core sees it, after HTTP validation.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub query: String,
    pub corpus_ids: Vec<String>,
    pub include_vector: bool,
    pub include_sparse: bool,
    pub include_graph: bool,
    pub top_k: Option<usize>,
    pub intent: Option<QueryIntent>,
}

impl SearchSpec {
    pub fn new(query: impl Into<String>, corpus_ids: Vec<String>) -> Self {
        Self {
            query: query.into(),
            corpus_ids,
            include_vector: true,
            include_sparse: true,
            include_graph: true,
            top_k: None,
            intent: None,
        }
    }
}

/// Shared handles every leg needs. Cheap to clone per request.
#[derive(Clone)]
pub struct SearchContext {
    pub db: Arc<SurrealDbClient>,
    pub embedder: Arc<EmbeddingProvider>,
    pub reranker: Option<Arc<RerankerRegistry>>,
    pub cancel: CancellationToken,
    /// Deadline applied to each individual leg.
    pub leg_deadline: Duration,
}

impl SearchContext {
    pub fn new(db: Arc<SurrealDbClient>, embedder: Arc<EmbeddingProvider>) -> Self {
        Self {
            db,
            embedder,
            reranker: None,
            cancel: CancellationToken::new(),
            leg_deadline: Duration::from_secs(8),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<RerankerRegistry>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_leg_deadline(mut self, deadline: Duration) -> Self {
        self.leg_deadline = deadline;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct SearchOutcome {
    pub matches: Vec<ChunkMatch>,
    pub debug: FusionDebug,
}

/// Full retrieval fan-out: plan, dispatch the legs, fuse, apply bonuses,
/// hydrate, rerank, truncate. Leg and reranker failures degrade into debug
/// entries; this function itself never fails a request.
#[instrument(skip_all, fields(corpus_ids = ?spec.corpus_ids))]
pub async fn run_search(
    ctx: &SearchContext,
    spec: &SearchSpec,
    config: &ScopedConfig,
) -> SearchOutcome {
    let plan = plan::build_plan(spec, config);
    let mut dbg = FusionDebug::new(config.fusion.method, plan.final_k);

    let report = dispatch::dispatch_legs(ctx, spec, &plan, config).await;
    report.record(&mut dbg);

    // Keep all three lists in leg order even when empty: weighted fusion
    // pairs them positionally with the configured leg weights.
    let ranked_lists: Vec<Vec<ChunkMatch>> = report.into_ordered_lists().into();

    let mut fused = match config.fusion.method {
        common::config::scoped::FusionMethod::Rrf => {
            fusion::rrf_fuse(&ranked_lists, config.retrieval.rrf_k)
        }
        common::config::scoped::FusionMethod::Weighted => fusion::weighted_fuse(
            &ranked_lists,
            &[
                config.fusion.vector_weight,
                config.fusion.sparse_weight,
                config.fusion.graph_weight,
            ],
        ),
    };

    fusion::apply_layer_bonuses(&mut fused, plan.intent, &config.scoring, &config.layer_bonuses);

    fused.truncate(config.reranking.tribrid_reranker_topn.max(plan.final_k));

    if let Err(err) = hydrate::hydrate_matches(
        &ctx.db,
        &mut fused,
        config.retrieval.hydration_mode,
        config.retrieval.hydration_max_chars,
    )
    .await
    {
        dbg.hydration_error = Some(err.to_string());
    }

    let (mut fused, rerank_debug) =
        rerank::rerank_matches(ctx, &spec.query, fused, &config.reranking).await;
    dbg.rerank = Some(rerank_debug);

    fused.truncate(plan.final_k);

    dbg.finalize(&fused, config);

    SearchOutcome {
        matches: fused,
        debug: dbg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::SparseLegSettings;
    use common::storage::types::chunk::Chunk;
    use uuid::Uuid;

    async fn seeded_context() -> SearchContext {
        let db = Arc::new(
            SurrealDbClient::memory("pipeline_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(32, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");

        let embedder = Arc::new(EmbeddingProvider::new_hashed(32));
        SearchContext::new(db, embedder)
    }

    async fn index_chunk(ctx: &SearchContext, id: &str, content: &str, path: &str) {
        let chunk = Chunk::new(
            id.to_string(),
            "repo".to_string(),
            content.to_string(),
            path.to_string(),
            1,
            20,
        );
        let embedding = ctx.embedder.embed(content).await.expect("embed");
        Chunk::store_with_embedding(chunk, embedding, &ctx.db)
            .await
            .expect("store chunk");
    }

    #[tokio::test]
    async fn search_returns_at_most_final_k_matches() {
        let ctx = seeded_context().await;
        for i in 0..6 {
            index_chunk(
                &ctx,
                &format!("c{i}"),
                &format!("retrieval fusion pipeline chunk number {i}"),
                &format!("src/part_{i}.rs"),
            )
            .await;
        }
        ctx.db.rebuild_indexes().await.expect("rebuild");

        let mut config = ScopedConfig::default();
        config.retrieval.final_k = 3;
        let spec = SearchSpec::new("retrieval fusion pipeline", vec!["repo".into()]);

        let outcome = run_search(&ctx, &spec, &config).await;
        assert!(outcome.matches.len() <= 3);
        assert!(!outcome.matches.is_empty());
        assert_eq!(outcome.debug.final_k_used, 3);
    }

    #[tokio::test]
    async fn empty_corpus_yields_empty_matches_with_debug() {
        let ctx = seeded_context().await;
        let config = ScopedConfig::default();
        let spec = SearchSpec::new("anything at all", vec!["repo".into()]);

        let outcome = run_search(&ctx, &spec, &config).await;
        assert!(outcome.matches.is_empty());
        assert!(outcome.debug.vector_attempted);
        assert!(outcome.debug.sparse_attempted);
        assert!(outcome.debug.graph_attempted);
    }

    #[tokio::test]
    async fn disabled_legs_are_not_attempted() {
        let ctx = seeded_context().await;
        let config = ScopedConfig::default();
        let mut spec = SearchSpec::new("query", vec!["repo".into()]);
        spec.include_vector = false;
        spec.include_graph = false;

        let outcome = run_search(&ctx, &spec, &config).await;
        assert!(!outcome.debug.vector_attempted);
        assert!(outcome.debug.sparse_attempted);
        assert!(!outcome.debug.graph_attempted);
    }

    #[tokio::test]
    async fn hydration_fills_vector_only_matches() {
        let ctx = seeded_context().await;
        index_chunk(&ctx, "c1", "cosine similarity embedding search", "src/vector.rs").await;
        ctx.db.rebuild_indexes().await.expect("rebuild");

        let mut config = ScopedConfig::default();
        config.sparse.enabled = false;
        config.graph.enabled = false;

        let spec = SearchSpec::new("cosine similarity embedding search", vec!["repo".into()]);
        let outcome = run_search(&ctx, &spec, &config).await;

        assert!(!outcome.matches.is_empty());
        let top = &outcome.matches[0];
        assert!(!top.content.is_empty(), "lazy hydration should fill content");
        assert_eq!(top.file_path, "src/vector.rs");
    }
}
