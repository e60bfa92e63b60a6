use common::{config::ScopedConfig, error::AppError, storage::types::chunk_embedding::ChunkEmbedding};
use tracing::debug;

use crate::{ChunkMatch, MatchSource, SearchContext};

/// Dense leg: embed the query, run ANN per corpus, filter by the similarity
/// threshold. Returns skeletal matches; content hydration happens after
/// fusion.
pub async fn run(
    ctx: &SearchContext,
    corpus_ids: &[String],
    query: &str,
    config: &ScopedConfig,
) -> Result<Vec<ChunkMatch>, AppError> {
    let embedding = ctx.embedder.embed(query).await?;
    let threshold = config.retrieval.similarity_threshold;

    let mut out = Vec::new();
    for corpus_id in corpus_ids {
        let hits = ChunkEmbedding::knn_search(
            &ctx.db,
            corpus_id,
            embedding.clone(),
            config.retrieval.topk_dense,
        )
        .await?;

        for hit in hits {
            if threshold > 0.0 && hit.score < threshold {
                continue;
            }
            let mut m = ChunkMatch::skeletal(
                hit.chunk_id,
                corpus_id.clone(),
                hit.score,
                MatchSource::Vector,
            );
            m.meta_insert("leg", serde_json::json!("vector"));
            out.push(m);
        }
    }

    // Stable leg-local order: score-descending, id ascending on ties.
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    debug!(results = out.len(), "Vector leg complete");
    Ok(out)
}
